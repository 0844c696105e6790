//! AMQP connection plumbing shared by the device transport and the service
//! feedback receiver
//!
//! Framing and the session layer belong to an [`AmqpEndpoint`]
//! implementation. This module owns what sits on top: the reactor task that
//! pumps connection events, and the handler slot that lets `close()` detach a
//! handler so late events are dropped.

pub mod feedback;
pub mod transport;

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::message::Message;

/// Which way a link carries messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    ///
    Sender,
    ///
    Receiver,
}

/// A link to attach when the connection opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    ///
    pub address: String,
    ///
    pub role: LinkRole,
}

/// Everything needed to open a connection and its links
#[derive(Debug, Clone)]
pub struct AmqpConnectOptions {
    /// Host to connect to on port 5671
    pub hostname: String,
    /// SASL PLAIN user name
    pub user_name: String,
    /// SASL PLAIN password, a shared access signature
    pub password: String,
    ///
    pub links: Vec<LinkSpec>,
}

/// Outcome the remote peer applied to a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    ///
    Accepted,
    ///
    Rejected {
        ///
        description: Option<String>,
    },
    ///
    Released,
    ///
    Modified,
}

/// Message as carried on an AMQP link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpMessage {
    ///
    pub body: Vec<u8>,
    ///
    pub message_id: Option<String>,
    ///
    pub correlation_id: Option<String>,
    ///
    pub user_id: Option<String>,
    ///
    pub content_type: Option<String>,
    ///
    pub content_encoding: Option<String>,
    ///
    pub absolute_expiry_time: Option<DateTime<Utc>>,
    ///
    pub application_properties: Vec<(String, String)>,
}

impl From<&Message> for AmqpMessage {
    fn from(message: &Message) -> Self {
        Self {
            body: message.body().to_vec(),
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id.clone(),
            user_id: None,
            content_type: message.content_type.clone(),
            content_encoding: message.content_encoding.clone(),
            absolute_expiry_time: message.expiry_time,
            application_properties: message.properties.clone(),
        }
    }
}

impl From<AmqpMessage> for Message {
    fn from(message: AmqpMessage) -> Self {
        Message {
            body: message.body,
            properties: message.application_properties,
            message_id: message.message_id,
            correlation_id: message.correlation_id,
            content_type: message.content_type,
            content_encoding: message.content_encoding,
            expiry_time: message.absolute_expiry_time,
        }
    }
}

/// Protocol events delivered to the reactor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmqpEvent {
    /// The connection and its links are up
    ConnectionInit,
    /// The peer settled one of our deliveries
    Delivered {
        ///
        delivery_tag: u64,
        ///
        outcome: DeliveryOutcome,
    },
    /// A message arrived on a receiver link
    MessageReceived {
        ///
        delivery_tag: u64,
        ///
        address: String,
        ///
        message: AmqpMessage,
    },
    /// The peer closed the connection or it was lost
    ConnectionClosed {
        ///
        error: Option<String>,
    },
}

/// Write side of an open connection
#[async_trait]
pub trait AmqpLink: Send + Sync + fmt::Debug {
    /// Transfer a message on the sender link attached to `address`
    async fn send(&mut self, address: &str, delivery_tag: u64, message: AmqpMessage)
        -> Result<()>;

    /// Apply a disposition to a received delivery
    async fn settle(&mut self, delivery_tag: u64, outcome: DeliveryOutcome) -> Result<()>;

    /// Detach links and close the connection
    async fn close(&mut self) -> Result<()>;
}

/// Opens connections; events for a connection arrive on the returned receiver
#[async_trait]
pub trait AmqpEndpoint: Send + Sync + fmt::Debug {
    ///
    async fn connect(
        &self,
        options: AmqpConnectOptions,
    ) -> Result<(Box<dyn AmqpLink>, UnboundedReceiver<AmqpEvent>)>;
}

/// Reacts to connection events on the reactor task
pub trait AmqpEventHandler: Send + Sync {
    ///
    fn on_event(&self, event: AmqpEvent);
}

/// Holds the handler a reactor dispatches to
///
/// Once invalidated, every later event is dropped.
#[derive(Default)]
pub struct HandlerSlot {
    handler: RwLock<Option<Arc<dyn AmqpEventHandler>>>,
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("active", &self.is_active())
            .finish()
    }
}

impl HandlerSlot {
    ///
    pub fn new(handler: Arc<dyn AmqpEventHandler>) -> Self {
        Self {
            handler: RwLock::new(Some(handler)),
        }
    }

    ///
    pub fn is_active(&self) -> bool {
        self.handler
            .read()
            .map(|handler| handler.is_some())
            .unwrap_or(false)
    }

    /// Detach the handler
    pub fn invalidate(&self) {
        match self.handler.write() {
            Ok(mut handler) => *handler = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    /// Hand `event` to the handler; `false` when the slot was invalidated
    pub fn dispatch(&self, event: AmqpEvent) -> bool {
        let handler = match self.handler.read() {
            Ok(handler) => handler.clone(),
            Err(_) => None,
        };
        match handler {
            Some(handler) => {
                handler.on_event(event);
                true
            }
            None => false,
        }
    }
}

/// Task pumping connection events into a handler
#[derive(Debug)]
pub struct Reactor {
    slot: Arc<HandlerSlot>,
    handle: JoinHandle<()>,
}

impl Reactor {
    /// Start dispatching `events` to `handler` on a dedicated task
    pub fn spawn(
        mut events: UnboundedReceiver<AmqpEvent>,
        handler: Arc<dyn AmqpEventHandler>,
    ) -> Self {
        let slot = Arc::new(HandlerSlot::new(handler));
        let dispatch_slot = slot.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                trace!("Reactor event {:?}", event);
                if !dispatch_slot.dispatch(event) {
                    trace!("Handler invalidated, dropping event");
                }
            }
            debug!("Reactor event stream ended");
        });

        Self { slot, handle }
    }

    /// Whether the event stream is still being pumped
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Invalidate the handler and stop the task
    pub fn stop(self) {
        self.slot.invalidate();
        self.handle.abort();
    }
}
