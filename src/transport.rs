use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::message::{Message, MessageCallback};
use crate::status::IotHubStatusCode;
use crate::token::{TokenSource, DEFAULT_DEVICE_TOKEN_VALIDITY_SECS};

/// Largest request body the hub accepts for a batch of events
pub const DEFAULT_BATCH_LIMIT: usize = 256 * 1024;
/// Default time to wait for an HTTPS response
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(240);

/// Wire protocol spoken by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Short-poll HTTPS
    Https,
    /// AMQP over TLS
    Amqps,
    /// MQTT over TLS
    Mqtt,
}

/// Connection lifecycle of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    ///
    Closed,
    ///
    Opening,
    ///
    Open,
    ///
    Closing,
}

/// Completion handler for a single outbound message
pub type EventCallback = Box<dyn FnOnce(IotHubStatusCode) + Send>;

/// Settings shared by every transport variant
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Host name of the hub, e.g. `myhub.azure-devices.net`
    pub hostname: String,
    /// Device identity to send as
    pub device_id: String,
    /// Credentials for the device
    pub token_source: Arc<dyn TokenSource>,
    /// Lifetime of each minted token
    pub token_validity: chrono::Duration,
    /// Bound on a single HTTPS exchange
    pub read_timeout: Duration,
    /// Largest serialized batch body
    pub batch_limit: usize,
}

impl TransportConfig {
    ///
    pub fn new(hostname: &str, device_id: &str, token_source: Arc<dyn TokenSource>) -> Self {
        Self {
            hostname: hostname.to_owned(),
            device_id: device_id.to_owned(),
            token_source,
            token_validity: chrono::Duration::seconds(DEFAULT_DEVICE_TOKEN_VALIDITY_SECS),
            read_timeout: DEFAULT_READ_TIMEOUT,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    /// Hub name without the DNS suffix
    pub fn hub_name(&self) -> &str {
        self.hostname.split('.').next().unwrap_or(&self.hostname)
    }
}

/// The callback of a queued packet
///
/// If the packet is dropped without an outcome, for example when a send
/// unwinds after draining the queue, the callback is reported as `Error` on
/// the queue it was taken from.
struct Completion {
    callback: Option<EventCallback>,
    owner: Weak<TransportQueues>,
}

impl Completion {
    fn into_callback(mut self) -> EventCallback {
        self.callback.take().unwrap_or_else(|| Box::new(|_| ()))
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let (Some(callback), Some(queues)) = (self.callback.take(), self.owner.upgrade()) {
            warn!("Message dropped without an outcome, reporting it as failed");
            queues.push_callback(callback, IotHubStatusCode::Error);
        }
    }
}

/// A message waiting to be sent
pub struct OutboundPacket {
    message: Message,
    completion: Completion,
    enqueued_at: DateTime<Utc>,
}

impl OutboundPacket {
    /// Bind `callback` and its `context` to a message
    ///
    /// The context is opaque to the transport and handed back unchanged when
    /// the callback fires.
    pub fn new<C, F>(message: Message, callback: F, context: C) -> Self
    where
        C: Send + 'static,
        F: FnOnce(IotHubStatusCode, C) + Send + 'static,
    {
        Self {
            message,
            completion: Completion {
                callback: Some(Box::new(move |status| callback(status, context))),
                owner: Weak::new(),
            },
            enqueued_at: Utc::now(),
        }
    }

    ///
    pub fn message(&self) -> &Message {
        &self.message
    }

    ///
    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Split into the message and its bound callback
    pub fn into_parts(self) -> (Message, EventCallback) {
        (self.message, self.completion.into_callback())
    }
}

impl fmt::Debug for OutboundPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundPacket")
            .field("message", &self.message)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

/// A completed send awaiting its callback
pub struct CallbackPacket {
    status: IotHubStatusCode,
    callback: EventCallback,
}

impl CallbackPacket {
    ///
    pub fn status(&self) -> IotHubStatusCode {
        self.status
    }
}

impl fmt::Debug for CallbackPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackPacket")
            .field("status", &self.status)
            .finish()
    }
}

#[derive(Debug)]
struct Queues {
    state: TransportState,
    outbound: VecDeque<OutboundPacket>,
    callbacks: VecDeque<CallbackPacket>,
}

/// Outbound and callback queues plus the lifecycle state guarding them
///
/// Shared between the application thread, which enqueues, and the worker
/// that drives the transport. Every mutation happens under one short lock;
/// callbacks are invoked after the lock is released.
#[derive(Debug)]
pub struct TransportQueues {
    inner: Mutex<Queues>,
}

impl Default for TransportQueues {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Queues {
                state: TransportState::Closed,
                outbound: VecDeque::new(),
                callbacks: VecDeque::new(),
            }),
        }
    }
}

impl TransportQueues {
    ///
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        // A panicking callback never runs under this lock, so the data is intact
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    ///
    pub fn state(&self) -> TransportState {
        self.lock().state
    }

    ///
    pub fn set_state(&self, state: TransportState) {
        self.lock().state = state;
    }

    /// Move to `to` only when currently in `from`
    pub fn transition(&self, from: TransportState, to: TransportState) -> bool {
        let mut queues = self.lock();
        if queues.state == from {
            queues.state = to;
            true
        } else {
            false
        }
    }

    /// Queue a packet for the next send; fails once closing has begun
    ///
    /// A refused packet is dropped without its callback being invoked.
    pub fn enqueue(self: &Arc<Self>, mut packet: OutboundPacket) -> Result<()> {
        let mut queues = self.lock();
        match queues.state {
            TransportState::Closed | TransportState::Closing => Err(Error::TransportClosed),
            _ => {
                packet.completion.owner = Arc::downgrade(self);
                queues.outbound.push_back(packet);
                Ok(())
            }
        }
    }

    /// Take every packet queued right now
    pub fn drain_outbound(&self) -> Vec<OutboundPacket> {
        self.lock().outbound.drain(..).collect()
    }

    /// Put packets back at the head of the queue, preserving their order
    pub fn requeue_front(&self, packets: Vec<OutboundPacket>) {
        if packets.is_empty() {
            return;
        }
        let mut queues = self.lock();
        for packet in packets.into_iter().rev() {
            queues.outbound.push_front(packet);
        }
    }

    /// Queue a callback that already has its outcome
    pub fn push_callback(&self, callback: EventCallback, status: IotHubStatusCode) {
        self.lock()
            .callbacks
            .push_back(CallbackPacket { status, callback });
    }

    /// Record the outcome for a packet
    pub fn complete(&self, packet: OutboundPacket, status: IotHubStatusCode) {
        self.push_callback(packet.completion.into_callback(), status);
    }

    ///
    pub fn complete_all<I>(&self, packets: I, status: IotHubStatusCode)
    where
        I: IntoIterator<Item = OutboundPacket>,
    {
        let mut queues = self.lock();
        for packet in packets {
            queues.callbacks.push_back(CallbackPacket {
                status,
                callback: packet.completion.into_callback(),
            });
        }
    }

    /// Enter `Closing` and fail everything still queued
    ///
    /// Both happen under one lock so no packet can slip in between.
    pub fn begin_close(&self) {
        let mut queues = self.lock();
        queues.state = TransportState::Closing;
        let aborted: Vec<_> = queues.outbound.drain(..).collect();
        if !aborted.is_empty() {
            debug!("Cancelling {} queued messages on close", aborted.len());
        }
        for packet in aborted {
            queues.callbacks.push_back(CallbackPacket {
                status: IotHubStatusCode::MessageCancelledOnClose,
                callback: packet.completion.into_callback(),
            });
        }
    }

    /// Invoke every completed callback once, oldest first
    ///
    /// Returns the number of callbacks invoked.
    pub fn invoke_callbacks(&self) -> usize {
        let ready: Vec<_> = self.lock().callbacks.drain(..).collect();
        let count = ready.len();
        for CallbackPacket { status, callback } in ready {
            if catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
                error!("Message callback panicked for status {}", status);
            }
        }
        count
    }

    /// No packets waiting to be sent or called back
    pub fn is_empty(&self) -> bool {
        let queues = self.lock();
        queues.outbound.is_empty() && queues.callbacks.is_empty()
    }

    ///
    pub fn outbound_len(&self) -> usize {
        self.lock().outbound.len()
    }
}

/// A connection to the hub over one wire protocol
///
/// `send_messages` and `handle_message` may fail; deciding whether a failure
/// is fatal is up to the caller (see [`crate::task`]).
#[async_trait]
pub trait Transport: Send {
    ///
    fn protocol(&self) -> Protocol;

    /// Queues shared with producers
    fn queues(&self) -> &Arc<TransportQueues>;

    /// Register the handler for cloud to device messages
    fn set_message_callback(&mut self, callback: MessageCallback);

    /// Establish the connection; a no-op when already open
    async fn open(&mut self) -> Result<()>;

    /// Fail queued packets with `MessageCancelledOnClose` and release the connection
    async fn close(&mut self) -> Result<()>;

    /// Deliver everything queued at the time of the call
    async fn send_messages(&mut self) -> Result<()>;

    /// Poll for at most one cloud to device message
    async fn handle_message(&mut self) -> Result<()>;

    ///
    fn state(&self) -> TransportState {
        self.queues().state()
    }

    ///
    fn add_message(&self, packet: OutboundPacket) -> Result<()> {
        self.queues().enqueue(packet)
    }

    ///
    fn invoke_callbacks(&self) -> usize {
        self.queues().invoke_callbacks()
    }

    ///
    fn is_empty(&self) -> bool {
        self.queues().is_empty()
    }
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .finish()
    }
}

/// Fail with `NotInitialized` unless the queues report `Open`
pub(crate) fn ensure_open(queues: &TransportQueues, what: &'static str) -> Result<()> {
    match queues.state() {
        TransportState::Open => Ok(()),
        _ => Err(Error::NotInitialized(what)),
    }
}
