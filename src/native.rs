//! Adapter for a device client implemented outside this crate
//!
//! A foreign library that already speaks to the hub can be driven through
//! [`NativeClientHandle`]. [`NativeTransport`] puts it behind the same
//! [`Transport`] contract as the in-crate transports so the queue and task
//! model is shared.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::message::{Message, MessageCallback};
use crate::status::IotHubStatusCode;
use crate::transport::{
    ensure_open, EventCallback, Protocol, Transport, TransportQueues, TransportState,
};

/// Operations a native client library exposes
///
/// The library may invoke send callbacks from its own threads.
pub trait NativeClientHandle: Send + fmt::Debug + Sized {
    /// Create a client for the device named in `connection_string`
    fn create_from_connection_string(connection_string: &str, protocol: Protocol)
        -> Result<Self>;

    /// Set a library specific option
    fn set_option(&mut self, name: &str, value: &str) -> Result<()>;

    /// Register the handler for cloud to device messages
    fn set_message_callback(&mut self, callback: MessageCallback) -> Result<()>;

    /// Hand a message to the library; `callback` reports its outcome
    fn send_event_async(&mut self, message: &Message, callback: EventCallback) -> Result<()>;

    /// Release the client; outstanding callbacks may never fire afterwards
    fn destroy(&mut self);
}

type CallbackSlot = Arc<Mutex<Option<EventCallback>>>;

fn take(slot: &CallbackSlot) -> Option<EventCallback> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// Drives a [`NativeClientHandle`] through the [`Transport`] contract
///
/// Each send callback sits in a slot shared with the library. Whoever takes
/// it first reports the outcome, so a message completes exactly once even
/// when the library fails, calls back late, or is destroyed first.
pub struct NativeTransport<H: NativeClientHandle> {
    connection_string: String,
    protocol: Protocol,
    options: Vec<(String, String)>,
    handle: Option<H>,
    queues: Arc<TransportQueues>,
    message_callback: Option<MessageCallback>,
    pending: Vec<CallbackSlot>,
}

impl<H: NativeClientHandle> fmt::Debug for NativeTransport<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeTransport")
            .field("protocol", &self.protocol)
            .field("handle", &self.handle)
            .field("pending", &self.pending.len())
            .field("queues", &self.queues)
            .finish()
    }
}

impl<H: NativeClientHandle> NativeTransport<H> {
    ///
    pub fn new(connection_string: &str, protocol: Protocol) -> Self {
        Self {
            connection_string: connection_string.to_owned(),
            protocol,
            options: Vec::new(),
            handle: None,
            queues: TransportQueues::new(),
            message_callback: None,
            pending: Vec::new(),
        }
    }

    /// Set an option now, or when the client is created if it does not exist yet
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.set_option(name, value),
            None => {
                self.options.push((name.to_owned(), value.to_owned()));
                Ok(())
            }
        }
    }

    fn create_handle(&mut self) -> Result<H> {
        let mut handle = H::create_from_connection_string(&self.connection_string, self.protocol)?;
        for (name, value) in &self.options {
            handle.set_option(name, value)?;
        }
        if let Some(callback) = self.message_callback.take() {
            handle.set_message_callback(callback)?;
        }
        Ok(handle)
    }
}

#[async_trait]
impl<H: NativeClientHandle + 'static> Transport for NativeTransport<H> {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn queues(&self) -> &Arc<TransportQueues> {
        &self.queues
    }

    fn set_message_callback(&mut self, callback: MessageCallback) {
        match self.handle.as_mut() {
            Some(handle) => {
                if let Err(e) = handle.set_message_callback(callback) {
                    error!("Native client refused message callback: {}", e);
                }
            }
            None => self.message_callback = Some(callback),
        }
    }

    async fn open(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.queues.set_state(TransportState::Opening);
        match self.create_handle() {
            Ok(handle) => {
                self.handle = Some(handle);
                self.queues.set_state(TransportState::Open);
                info!("Native {:?} client created", self.protocol);
                Ok(())
            }
            Err(e) => {
                self.queues.set_state(TransportState::Closed);
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.queues.state() == TransportState::Closed {
            return Ok(());
        }
        self.queues.begin_close();
        if let Some(mut handle) = self.handle.take() {
            handle.destroy();
        }

        let cancelled = self.pending.drain(..).filter_map(|slot| take(&slot));
        for callback in cancelled {
            self.queues
                .push_callback(callback, IotHubStatusCode::MessageCancelledOnClose);
        }
        self.queues.set_state(TransportState::Closed);
        Ok(())
    }

    async fn send_messages(&mut self) -> Result<()> {
        ensure_open(&self.queues, "native transport")?;
        self.pending
            .retain(|slot| slot.lock().map(|s| s.is_some()).unwrap_or(false));

        let handle = self
            .handle
            .as_mut()
            .ok_or(Error::NotInitialized("native client"))?;

        let mut packets = self.queues.drain_outbound().into_iter();
        while let Some(packet) = packets.next() {
            let (message, callback) = packet.into_parts();
            let slot: CallbackSlot = Arc::new(Mutex::new(Some(callback)));

            let queues = self.queues.clone();
            let native_slot = slot.clone();
            let report: EventCallback = Box::new(move |status| {
                if let Some(callback) = take(&native_slot) {
                    queues.push_callback(callback, status);
                }
            });

            if let Err(e) = handle.send_event_async(&message, report) {
                warn!("Native client failed to accept message: {}", e);
                if let Some(callback) = take(&slot) {
                    self.queues.push_callback(callback, IotHubStatusCode::Error);
                }
                self.queues.complete_all(packets, IotHubStatusCode::Error);
                return Err(e);
            }
            self.pending.push(slot);
        }

        Ok(())
    }

    async fn handle_message(&mut self) -> Result<()> {
        // The native client delivers messages to its callback on its own
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageResult;
    use crate::transport::OutboundPacket;

    #[derive(Default)]
    struct MockHandle {
        options: Vec<(String, String)>,
        has_callback: bool,
        accepted: Vec<(Message, EventCallback)>,
        destroyed: bool,
    }

    impl fmt::Debug for MockHandle {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("MockHandle")
                .field("accepted", &self.accepted.len())
                .field("destroyed", &self.destroyed)
                .finish()
        }
    }

    impl NativeClientHandle for MockHandle {
        fn create_from_connection_string(
            connection_string: &str,
            _protocol: Protocol,
        ) -> Result<Self> {
            if connection_string.contains("SharedAccessKey=") {
                Ok(Self::default())
            } else {
                Err(Error::InvalidArgument("no key".to_owned()))
            }
        }

        fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
            self.options.push((name.to_owned(), value.to_owned()));
            Ok(())
        }

        fn set_message_callback(&mut self, callback: MessageCallback) -> Result<()> {
            self.has_callback = callback(&Message::new(vec![])) == MessageResult::Complete;
            Ok(())
        }

        fn send_event_async(&mut self, message: &Message, callback: EventCallback) -> Result<()> {
            if message.body() == b"refuse" {
                return Err(Error::Protocol("queue full".to_owned()));
            }
            self.accepted.push((message.clone(), callback));
            Ok(())
        }

        fn destroy(&mut self) {
            self.destroyed = true;
        }
    }

    const CONNECTION_STRING: &str =
        "HostName=hub.azure-devices.net;DeviceId=d;SharedAccessKey=a2V5";

    type Log = Arc<Mutex<Vec<(&'static str, IotHubStatusCode)>>>;

    fn enqueue(transport: &NativeTransport<MockHandle>, log: &Log, body: &'static str) {
        let log = log.clone();
        transport
            .add_message(OutboundPacket::new(
                Message::new(body.as_bytes().to_vec()),
                move |status, context| log.lock().unwrap().push((context, status)),
                body,
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn options_and_callback_are_applied_on_open() {
        let mut transport = NativeTransport::<MockHandle>::new(CONNECTION_STRING, Protocol::Amqps);
        transport.set_option("logtrace", "true").unwrap();
        transport.set_message_callback(Box::new(|_| MessageResult::Complete));

        transport.open().await.unwrap();

        let handle = transport.handle.as_ref().unwrap();
        assert_eq!(handle.options, vec![("logtrace".to_owned(), "true".to_owned())]);
        assert!(handle.has_callback);
        assert_eq!(transport.state(), TransportState::Open);
    }

    #[tokio::test]
    async fn open_fails_for_bad_connection_string() {
        let mut transport = NativeTransport::<MockHandle>::new("HostName=x", Protocol::Mqtt);
        assert!(transport.open().await.is_err());
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn library_callback_completes_each_message_once() {
        let mut transport = NativeTransport::<MockHandle>::new(CONNECTION_STRING, Protocol::Https);
        transport.open().await.unwrap();
        let log = Log::default();
        enqueue(&transport, &log, "a");
        enqueue(&transport, &log, "b");
        transport.send_messages().await.unwrap();

        let accepted = std::mem::take(&mut transport.handle.as_mut().unwrap().accepted);
        for (message, callback) in accepted {
            let status = if message.body() == b"a" {
                IotHubStatusCode::Ok
            } else {
                IotHubStatusCode::ServerBusy
            };
            callback(status);
        }
        transport.invoke_callbacks();

        // Closing afterwards must not report them again
        transport.close().await.unwrap();
        transport.invoke_callbacks();
        assert_eq!(
            *log.lock().unwrap(),
            vec![("a", IotHubStatusCode::Ok), ("b", IotHubStatusCode::ServerBusy)]
        );
    }

    #[tokio::test]
    async fn refused_send_fails_the_rest_of_the_batch() {
        let mut transport = NativeTransport::<MockHandle>::new(CONNECTION_STRING, Protocol::Https);
        transport.open().await.unwrap();
        let log = Log::default();
        enqueue(&transport, &log, "refuse");
        enqueue(&transport, &log, "after");

        assert!(transport.send_messages().await.is_err());
        transport.invoke_callbacks();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("refuse", IotHubStatusCode::Error),
                ("after", IotHubStatusCode::Error)
            ]
        );
    }

    #[tokio::test]
    async fn destroy_cancels_unreported_messages() {
        let mut transport = NativeTransport::<MockHandle>::new(CONNECTION_STRING, Protocol::Https);
        transport.open().await.unwrap();
        let log = Log::default();
        enqueue(&transport, &log, "in-flight");
        transport.send_messages().await.unwrap();
        let accepted = std::mem::take(&mut transport.handle.as_mut().unwrap().accepted);

        transport.close().await.unwrap();
        // A late callback from the library is ignored
        for (_, callback) in accepted {
            callback(IotHubStatusCode::Ok);
        }
        transport.invoke_callbacks();

        assert_eq!(
            *log.lock().unwrap(),
            vec![("in-flight", IotHubStatusCode::MessageCancelledOnClose)]
        );
    }
}
