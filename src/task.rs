//! Periodic send and receive ticks
//!
//! A tick never fails: errors and panics raised by the transport are logged
//! and dropped so the scheduler keeps going.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::transport::Transport;

/// Transport shared between the client and its tasks
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// One unit of periodic work
#[async_trait]
pub trait Tick: Send + Sync + 'static {
    /// Run once; must not panic or fail
    async fn run(&self);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Sends queued messages and then invokes completed callbacks
#[derive(Debug, Clone)]
pub struct SendTask {
    transport: SharedTransport,
}

impl SendTask {
    ///
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Tick for SendTask {
    async fn run(&self) {
        let queues = self.transport.lock().await.queues().clone();
        let send = async { self.transport.lock().await.send_messages().await };

        match AssertUnwindSafe(send).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Send task failed: {}", e),
            Err(panic) => error!("Send task panicked: {}", panic_message(&*panic)),
        }

        // Callbacks run without holding the transport, even after a panic
        queues.invoke_callbacks();
    }
}

/// Polls for one cloud to device message
#[derive(Debug, Clone)]
pub struct ReceiveTask {
    transport: SharedTransport,
}

impl ReceiveTask {
    ///
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Tick for ReceiveTask {
    async fn run(&self) {
        let tick = async { self.transport.lock().await.handle_message().await };

        match AssertUnwindSafe(tick).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Receive task failed: {}", e),
            Err(panic) => error!("Receive task panicked: {}", panic_message(&*panic)),
        }
    }
}

/// Handle to a task started with [`schedule`]
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ScheduledTask {
    /// Stop scheduling new ticks and wait for a running tick to finish
    ///
    /// A tick in progress is never cancelled part way through.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("Scheduled task ended abnormally: {}", e);
        }
    }
}

/// Run `task` every `period` with a fixed delay between ticks
pub fn schedule<T: Tick>(task: T, period: Duration) -> ScheduledTask {
    let (shutdown, mut stopped) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => task.run().await,
                _ = stopped.changed() => break,
            }
        }
    });

    ScheduledTask { handle, shutdown }
}
