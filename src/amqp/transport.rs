//! AMQPS device transport

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use super::{
    AmqpConnectOptions, AmqpEndpoint, AmqpEvent, AmqpEventHandler, AmqpLink, AmqpMessage,
    DeliveryOutcome, LinkRole, LinkSpec, Reactor,
};
use crate::error::{Error, Result};
use crate::message::{MessageCallback, MessageResult};
use crate::status::IotHubStatusCode;
use crate::token::TokenRenewal;
use crate::transport::{
    ensure_open, OutboundPacket, Protocol, Transport, TransportConfig, TransportQueues,
    TransportState,
};

/// How long `open()` waits for the connection to come up
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

fn events_address(device_id: &str) -> String {
    format!("/devices/{}/messages/events", device_id)
}

fn device_bound_address(device_id: &str) -> String {
    format!("/devices/{}/messages/devicebound", device_id)
}

fn status_for(outcome: &DeliveryOutcome) -> IotHubStatusCode {
    match outcome {
        DeliveryOutcome::Accepted => IotHubStatusCode::Ok,
        DeliveryOutcome::Rejected { .. }
        | DeliveryOutcome::Released
        | DeliveryOutcome::Modified => IotHubStatusCode::Error,
    }
}

/// State touched by the reactor for one connection
struct ConnectionHandler {
    queues: Arc<TransportQueues>,
    in_flight: Mutex<HashMap<u64, OutboundPacket>>,
    received: Mutex<VecDeque<(u64, AmqpMessage)>>,
    opened: Semaphore,
    lost: AtomicBool,
}

impl ConnectionHandler {
    fn new(queues: Arc<TransportQueues>) -> Self {
        Self {
            queues,
            in_flight: Mutex::new(HashMap::new()),
            received: Mutex::new(VecDeque::new()),
            opened: Semaphore::new(0),
            lost: AtomicBool::new(false),
        }
    }

    fn track(&self, delivery_tag: u64, packet: OutboundPacket) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(delivery_tag, packet);
    }

    fn untrack(&self, delivery_tag: u64) -> Option<OutboundPacket> {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&delivery_tag)
    }

    /// Complete every unacknowledged delivery with `status`, oldest tag first
    fn fail_in_flight(&self, status: IotHubStatusCode) {
        let mut pending: Vec<_> = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        pending.sort_by_key(|(tag, _)| *tag);
        self.queues
            .complete_all(pending.into_iter().map(|(_, packet)| packet), status);
    }

    fn next_received(&self) -> Option<(u64, AmqpMessage)> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

impl AmqpEventHandler for ConnectionHandler {
    fn on_event(&self, event: AmqpEvent) {
        match event {
            AmqpEvent::ConnectionInit => {
                if self
                    .queues
                    .transition(TransportState::Opening, TransportState::Open)
                {
                    info!("AMQP connection open");
                }
                self.opened.add_permits(1);
            }
            AmqpEvent::Delivered {
                delivery_tag,
                outcome,
            } => match self.untrack(delivery_tag) {
                Some(packet) => {
                    if outcome != DeliveryOutcome::Accepted {
                        warn!("Delivery {} settled as {:?}", delivery_tag, outcome);
                    }
                    self.queues.complete(packet, status_for(&outcome));
                }
                None => debug!("Outcome for unknown delivery {}", delivery_tag),
            },
            AmqpEvent::MessageReceived {
                delivery_tag,
                message,
                ..
            } => {
                self.received
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_back((delivery_tag, message));
            }
            AmqpEvent::ConnectionClosed { error } => {
                warn!("AMQP connection lost: {:?}", error);
                self.lost.store(true, Ordering::SeqCst);
                self.fail_in_flight(IotHubStatusCode::Error);
            }
        }
    }
}

/// Device transport over a persistent AMQP connection
///
/// Each message is its own transfer. Outcomes arrive on the reactor and
/// land in the callback queue in the order the hub settled them.
pub struct AmqpsTransport {
    config: TransportConfig,
    endpoint: Arc<dyn AmqpEndpoint>,
    token: TokenRenewal,
    queues: Arc<TransportQueues>,
    link: Option<Box<dyn AmqpLink>>,
    reactor: Option<Reactor>,
    handler: Arc<ConnectionHandler>,
    next_tag: u64,
    message_callback: Option<MessageCallback>,
    open_timeout: Duration,
}

impl std::fmt::Debug for AmqpsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpsTransport")
            .field("hostname", &self.config.hostname)
            .field("device_id", &self.config.device_id)
            .field("endpoint", &self.endpoint)
            .field("reactor", &self.reactor)
            .field("queues", &self.queues)
            .finish()
    }
}

impl AmqpsTransport {
    ///
    pub fn new(config: TransportConfig, endpoint: Arc<dyn AmqpEndpoint>) -> Self {
        let token = TokenRenewal::new(config.token_source.clone(), config.token_validity);
        let queues = TransportQueues::new();
        Self {
            config,
            endpoint,
            token,
            handler: Arc::new(ConnectionHandler::new(queues.clone())),
            queues,
            link: None,
            reactor: None,
            next_tag: 0,
            message_callback: None,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }

    /// Bound the wait for the connection to come up
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    async fn connect(&mut self) -> Result<()> {
        let password = self.token.token(Utc::now())?.to_string();
        let options = AmqpConnectOptions {
            hostname: self.config.hostname.clone(),
            user_name: format!("{}@sas.{}", self.config.device_id, self.config.hub_name()),
            password,
            links: vec![
                LinkSpec {
                    address: events_address(&self.config.device_id),
                    role: LinkRole::Sender,
                },
                LinkSpec {
                    address: device_bound_address(&self.config.device_id),
                    role: LinkRole::Receiver,
                },
            ],
        };

        let (link, events) = self.endpoint.connect(options).await?;
        let handler = Arc::new(ConnectionHandler::new(self.queues.clone()));
        self.reactor = Some(Reactor::spawn(events, handler.clone()));
        self.handler = handler;
        self.link = Some(link);

        match tokio::time::timeout(self.open_timeout, self.handler.opened.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(Error::Protocol("connection closed while opening".to_owned())),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Stop the reactor and release the link, completing unacknowledged
    /// deliveries with `status`
    async fn teardown(&mut self, status: IotHubStatusCode) {
        if let Some(reactor) = self.reactor.take() {
            reactor.stop();
        }
        self.handler.fail_in_flight(status);
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close().await {
                warn!("Error closing AMQP link: {}", e);
            }
        }
    }

    /// Replace a lost connection or one whose token is about to lapse
    async fn reconnect_if_needed(&mut self) -> Result<()> {
        let lost = self.handler.lost.load(Ordering::SeqCst)
            || !self.reactor.as_ref().map_or(false, Reactor::is_running);
        if !lost && !self.token.needs_renewal(Utc::now()) {
            return Ok(());
        }

        info!("Re-establishing AMQP connection for {}", self.config.device_id);
        self.teardown(IotHubStatusCode::Error).await;
        self.connect().await
    }
}

#[async_trait]
impl Transport for AmqpsTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Amqps
    }

    fn queues(&self) -> &Arc<TransportQueues> {
        &self.queues
    }

    fn set_message_callback(&mut self, callback: MessageCallback) {
        self.message_callback = Some(callback);
    }

    async fn open(&mut self) -> Result<()> {
        if self.queues.state() == TransportState::Open {
            return Ok(());
        }
        self.queues.set_state(TransportState::Opening);
        if let Err(e) = self.connect().await {
            error!("AMQP open failed: {}", e);
            self.teardown(IotHubStatusCode::Error).await;
            self.queues.set_state(TransportState::Closed);
            return Err(e);
        }
        // The reactor moved the state to Open on ConnectionInit
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.queues.state() == TransportState::Closed {
            return Ok(());
        }
        self.queues.begin_close();
        self.teardown(IotHubStatusCode::MessageCancelledOnClose).await;
        self.token.invalidate();
        self.queues.set_state(TransportState::Closed);
        info!("AMQP transport closed for {}", self.config.device_id);
        Ok(())
    }

    async fn send_messages(&mut self) -> Result<()> {
        ensure_open(&self.queues, "amqps transport")?;
        if self.queues.outbound_len() == 0 {
            return Ok(());
        }
        self.reconnect_if_needed().await?;

        let address = events_address(&self.config.device_id);
        let now = Utc::now();
        let mut packets = self.queues.drain_outbound().into_iter();
        while let Some(packet) = packets.next() {
            if packet.message().is_expired(now) {
                self.queues.complete(packet, IotHubStatusCode::MessageExpired);
                continue;
            }

            let delivery_tag = self.next_tag;
            self.next_tag += 1;
            let message = AmqpMessage::from(packet.message());
            // Track before the transfer so an immediate outcome finds it
            self.handler.track(delivery_tag, packet);

            let link = match self.link.as_mut() {
                Some(link) => link,
                None => {
                    self.handler.fail_in_flight(IotHubStatusCode::Error);
                    self.queues.requeue_front(packets.collect());
                    return Err(Error::NotInitialized("amqps link"));
                }
            };
            if let Err(e) = link.send(&address, delivery_tag, message).await {
                if let Some(packet) = self.handler.untrack(delivery_tag) {
                    self.queues.complete(packet, IotHubStatusCode::Error);
                }
                self.queues.requeue_front(packets.collect());
                self.handler.lost.store(true, Ordering::SeqCst);
                return Err(e);
            }
            trace!("Sent delivery {}", delivery_tag);
        }

        Ok(())
    }

    async fn handle_message(&mut self) -> Result<()> {
        let callback = match &self.message_callback {
            Some(callback) => callback,
            None => return Ok(()),
        };
        ensure_open(&self.queues, "amqps transport")?;

        let (delivery_tag, message) = match self.handler.next_received() {
            Some(received) => received,
            None => return Ok(()),
        };

        let result = callback(&message.into());
        let outcome = match result {
            MessageResult::Complete => DeliveryOutcome::Accepted,
            MessageResult::Abandon => DeliveryOutcome::Released,
            MessageResult::Reject => DeliveryOutcome::Rejected { description: None },
        };
        debug!("Settling delivery {} as {:?}", delivery_tag, outcome);

        match self.link.as_mut() {
            Some(link) => link.settle(delivery_tag, outcome).await,
            None => Err(Error::NotInitialized("amqps link")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::{wait_until, MockEndpoint};
    use super::*;
    use crate::message::Message;
    use crate::token::{DeviceKeyTokenSource, SasTokenSource};

    fn config() -> TransportConfig {
        let source = DeviceKeyTokenSource::new(
            "myhub.azure-devices.net",
            "device-1",
            "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=",
        )
        .unwrap();
        TransportConfig::new("myhub.azure-devices.net", "device-1", Arc::new(source))
    }

    type Log = Arc<Mutex<Vec<(u32, IotHubStatusCode)>>>;

    fn enqueue(transport: &AmqpsTransport, log: &Log, context: u32) {
        let log = log.clone();
        transport
            .add_message(OutboundPacket::new(
                Message::new(vec![context as u8]),
                move |status, context| log.lock().unwrap().push((context, status)),
                context,
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn open_waits_for_connection_init() {
        let endpoint = MockEndpoint::new();
        let mut transport = AmqpsTransport::new(config(), Arc::new(endpoint.clone()));
        assert_eq!(transport.state(), TransportState::Closed);

        transport.open().await.unwrap();
        assert_eq!(transport.state(), TransportState::Open);
        transport.open().await.unwrap();

        let recorded = endpoint.recorded.lock().unwrap();
        assert_eq!(recorded.connects.len(), 1);
        let options = &recorded.connects[0];
        assert_eq!(options.user_name, "device-1@sas.myhub");
        assert!(options.password.starts_with("SharedAccessSignature sr="));
        assert_eq!(options.links[0].address, "/devices/device-1/messages/events");
    }

    #[tokio::test]
    async fn open_times_out_without_init() {
        let mut endpoint = MockEndpoint::new();
        endpoint.auto_init = false;
        let mut transport = AmqpsTransport::new(config(), Arc::new(endpoint))
            .with_open_timeout(Duration::from_millis(20));

        assert!(matches!(transport.open().await, Err(Error::Timeout)));
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn each_message_is_its_own_delivery() {
        let endpoint = MockEndpoint::new();
        let mut transport = AmqpsTransport::new(config(), Arc::new(endpoint.clone()));
        transport.open().await.unwrap();
        let log = Log::default();
        enqueue(&transport, &log, 1);
        enqueue(&transport, &log, 2);

        transport.send_messages().await.unwrap();
        assert!(
            wait_until(|| {
                transport.invoke_callbacks();
                log.lock().unwrap().len() == 2
            })
            .await
        );

        assert_eq!(endpoint.recorded.lock().unwrap().sent.len(), 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, IotHubStatusCode::Ok), (2, IotHubStatusCode::Ok)]
        );
    }

    #[tokio::test]
    async fn rejected_delivery_reports_error() {
        let mut endpoint = MockEndpoint::new();
        endpoint.auto_outcome = Some(DeliveryOutcome::Rejected {
            description: Some("too big".to_owned()),
        });
        let mut transport = AmqpsTransport::new(config(), Arc::new(endpoint));
        transport.open().await.unwrap();
        let log = Log::default();
        enqueue(&transport, &log, 5);

        transport.send_messages().await.unwrap();
        wait_until(|| {
            transport.invoke_callbacks();
            !log.lock().unwrap().is_empty()
        })
        .await;

        assert_eq!(*log.lock().unwrap(), vec![(5, IotHubStatusCode::Error)]);
    }

    #[tokio::test]
    async fn close_cancels_queued_and_unacknowledged_messages() {
        let mut endpoint = MockEndpoint::new();
        endpoint.auto_outcome = None;
        let mut transport = AmqpsTransport::new(config(), Arc::new(endpoint.clone()));
        transport.open().await.unwrap();
        let log = Log::default();
        enqueue(&transport, &log, 1);
        transport.send_messages().await.unwrap();
        enqueue(&transport, &log, 2);

        transport.close().await.unwrap();
        transport.invoke_callbacks();

        assert_eq!(transport.state(), TransportState::Closed);
        let mut seen = log.lock().unwrap().clone();
        seen.sort_by_key(|(context, _)| *context);
        assert_eq!(
            seen,
            vec![
                (1, IotHubStatusCode::MessageCancelledOnClose),
                (2, IotHubStatusCode::MessageCancelledOnClose)
            ]
        );
        assert_eq!(endpoint.recorded.lock().unwrap().closed, 1);

        // Late outcome for the cancelled delivery is ignored
        endpoint.inject(AmqpEvent::Delivered {
            delivery_tag: 0,
            outcome: DeliveryOutcome::Accepted,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.invoke_callbacks(), 0);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_transfer_requeues_the_rest() {
        let mut endpoint = MockEndpoint::new();
        endpoint.fail_sends = true;
        let mut transport = AmqpsTransport::new(config(), Arc::new(endpoint));
        transport.open().await.unwrap();
        let log = Log::default();
        enqueue(&transport, &log, 1);
        enqueue(&transport, &log, 2);

        assert!(transport.send_messages().await.is_err());
        transport.invoke_callbacks();

        assert_eq!(*log.lock().unwrap(), vec![(1, IotHubStatusCode::Error)]);
        assert_eq!(transport.queues().outbound_len(), 1);
    }

    #[tokio::test]
    async fn lost_connection_is_replaced_on_next_send() {
        let endpoint = MockEndpoint::new();
        let mut transport = AmqpsTransport::new(config(), Arc::new(endpoint.clone()));
        transport.open().await.unwrap();
        endpoint.inject(AmqpEvent::ConnectionClosed {
            error: Some("amqp:connection:forced".to_owned()),
        });
        assert!(wait_until(|| transport.handler.lost.load(Ordering::SeqCst)).await);

        let log = Log::default();
        enqueue(&transport, &log, 9);
        transport.send_messages().await.unwrap();
        wait_until(|| {
            transport.invoke_callbacks();
            !log.lock().unwrap().is_empty()
        })
        .await;

        assert_eq!(endpoint.recorded.lock().unwrap().connects.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec![(9, IotHubStatusCode::Ok)]);
    }

    #[tokio::test]
    async fn fixed_token_near_expiry_keeps_the_connection() {
        let mut endpoint = MockEndpoint::new();
        endpoint.auto_outcome = None;
        let sas = format!(
            "SharedAccessSignature sr=myhub.azure-devices.net%2Fdevices%2Fdevice-1&sig=abc&se={}",
            Utc::now().timestamp() + 120
        );
        let source = SasTokenSource::new(&sas).unwrap();
        let config =
            TransportConfig::new("myhub.azure-devices.net", "device-1", Arc::new(source));
        let mut transport = AmqpsTransport::new(config, Arc::new(endpoint.clone()));
        transport.open().await.unwrap();
        let log = Log::default();

        for context in 0..3 {
            enqueue(&transport, &log, context);
            transport.send_messages().await.unwrap();
        }
        transport.invoke_callbacks();

        let recorded = endpoint.recorded.lock().unwrap();
        assert_eq!(recorded.connects.len(), 1);
        assert_eq!(recorded.sent.len(), 3);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn token_renewal_reconnects_and_fails_unacknowledged_deliveries() {
        let mut endpoint = MockEndpoint::new();
        endpoint.auto_outcome = None;
        let mut config = config();
        config.token_validity = chrono::Duration::seconds(2);
        let mut transport = AmqpsTransport::new(config, Arc::new(endpoint.clone()));
        transport.open().await.unwrap();
        let log = Log::default();

        enqueue(&transport, &log, 1);
        transport.send_messages().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        enqueue(&transport, &log, 2);
        transport.send_messages().await.unwrap();
        transport.invoke_callbacks();

        let recorded = endpoint.recorded.lock().unwrap();
        assert_eq!(recorded.connects.len(), 2);
        assert_eq!(recorded.sent.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec![(1, IotHubStatusCode::Error)]);
    }

    #[tokio::test]
    async fn received_message_is_settled_by_callback_result() {
        let endpoint = MockEndpoint::new();
        let mut transport = AmqpsTransport::new(config(), Arc::new(endpoint.clone()));
        transport.set_message_callback(Box::new(|message: &Message| {
            if message.body() == b"ok" {
                MessageResult::Complete
            } else {
                MessageResult::Reject
            }
        }));
        transport.open().await.unwrap();

        for (tag, body) in [(10u64, "ok"), (11, "bad")] {
            endpoint.inject(AmqpEvent::MessageReceived {
                delivery_tag: tag,
                address: "/devices/device-1/messages/devicebound".to_owned(),
                message: AmqpMessage {
                    body: body.as_bytes().to_vec(),
                    ..Default::default()
                },
            });
        }
        assert!(wait_until(|| transport.handler.received.lock().unwrap().len() == 2).await);

        transport.handle_message().await.unwrap();
        transport.handle_message().await.unwrap();
        transport.handle_message().await.unwrap();

        assert_eq!(
            endpoint.recorded.lock().unwrap().settled,
            vec![
                (10, DeliveryOutcome::Accepted),
                (11, DeliveryOutcome::Rejected { description: None })
            ]
        );
    }
}
