use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::amqp::transport::AmqpsTransport;
use crate::amqp::AmqpEndpoint;
use crate::error::{Error, Result};
#[cfg(feature = "https")]
use crate::https::HttpsTransport;
use crate::message::{Message, MessageResult};
#[cfg(feature = "mqtt")]
use crate::mqtt_transport::MqttTransport;
use crate::status::IotHubStatusCode;
use crate::task::{schedule, ReceiveTask, ScheduledTask, SendTask, SharedTransport};
use crate::transport::{
    OutboundPacket, Protocol, Transport, TransportConfig, TransportQueues, TransportState,
};

/// Delay between send ticks
pub const DEFAULT_SEND_PERIOD: Duration = Duration::from_millis(10);
/// Delay between receive ticks for connection oriented protocols
pub const DEFAULT_RECEIVE_PERIOD: Duration = Duration::from_millis(10);
/// Delay between receive ticks for HTTPS, which polls the hub
pub const DEFAULT_HTTPS_RECEIVE_PERIOD: Duration = Duration::from_secs(25 * 60);

/// How often the hub is polled for cloud to device messages by default
pub fn default_receive_period(protocol: Protocol) -> Duration {
    match protocol {
        Protocol::Https => DEFAULT_HTTPS_RECEIVE_PERIOD,
        Protocol::Amqps | Protocol::Mqtt => DEFAULT_RECEIVE_PERIOD,
    }
}

/// Everything needed to create a [`DeviceClient`]
#[derive(Debug, Clone)]
pub struct DeviceClientConfig {
    /// Connection settings handed to the transport
    pub transport: TransportConfig,
    ///
    pub protocol: Protocol,
    /// Connection provider, required for [`Protocol::Amqps`]
    pub amqp_endpoint: Option<Arc<dyn AmqpEndpoint>>,
    ///
    pub send_period: Duration,
    ///
    pub receive_period: Duration,
}

impl DeviceClientConfig {
    /// Configuration with the default periods for `protocol`
    pub fn new(transport: TransportConfig, protocol: Protocol) -> Self {
        Self {
            transport,
            protocol,
            amqp_endpoint: None,
            send_period: DEFAULT_SEND_PERIOD,
            receive_period: default_receive_period(protocol),
        }
    }

    fn create_transport(self) -> Result<Box<dyn Transport>> {
        match self.protocol {
            #[cfg(feature = "https")]
            Protocol::Https => Ok(Box::new(HttpsTransport::with_hyper(self.transport))),
            #[cfg(not(feature = "https"))]
            Protocol::Https => Err(Error::InvalidArgument(
                "built without the `https` feature".to_owned(),
            )),
            Protocol::Amqps => {
                let endpoint = self.amqp_endpoint.ok_or_else(|| {
                    Error::InvalidArgument("AMQPS requires an AMQP endpoint".to_owned())
                })?;
                Ok(Box::new(AmqpsTransport::new(self.transport, endpoint)))
            }
            #[cfg(feature = "mqtt")]
            Protocol::Mqtt => Ok(Box::new(MqttTransport::new(self.transport)?)),
            #[cfg(not(feature = "mqtt"))]
            Protocol::Mqtt => Err(Error::InvalidArgument(
                "built without the `mqtt` feature".to_owned(),
            )),
        }
    }
}

/// Client for communicating with IoT hub
///
/// Owns one transport and the two scheduled tasks that drive it. Messages
/// are queued by [`DeviceClient::send_event_async`] without waiting for the
/// network; their callbacks fire from the send task.
#[derive(Debug)]
pub struct DeviceClient {
    transport: SharedTransport,
    queues: Arc<TransportQueues>,
    send_period: Duration,
    receive_period: Duration,
    tasks: Vec<ScheduledTask>,
}

impl DeviceClient {
    /// Create a client driving `transport` with the default periods for its protocol
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let receive_period = default_receive_period(transport.protocol());
        let queues = transport.queues().clone();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            queues,
            send_period: DEFAULT_SEND_PERIOD,
            receive_period,
            tasks: Vec::new(),
        }
    }

    /// Create a client and the transport named by `config.protocol`
    pub fn from_config(config: DeviceClientConfig) -> Result<Self> {
        let send_period = config.send_period;
        let receive_period = config.receive_period;
        let client = Self::new(config.create_transport()?);
        Ok(client.with_periods(send_period, receive_period))
    }

    /// Override the tick periods
    pub fn with_periods(mut self, send_period: Duration, receive_period: Duration) -> Self {
        self.send_period = send_period;
        self.receive_period = receive_period;
        self
    }

    ///
    pub fn state(&self) -> TransportState {
        self.queues.state()
    }

    /// Open the transport and start the send and receive tasks
    pub async fn open(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Ok(());
        }
        self.transport.lock().await.open().await?;

        self.tasks.push(schedule(
            SendTask::new(self.transport.clone()),
            self.send_period,
        ));
        self.tasks.push(schedule(
            ReceiveTask::new(self.transport.clone()),
            self.receive_period,
        ));
        debug!(
            "Scheduled send every {:?} and receive every {:?}",
            self.send_period, self.receive_period
        );
        Ok(())
    }

    /// Queue a device to cloud message
    ///
    /// `callback` is invoked exactly once with the outcome and `context`.
    /// Fails with [`Error::TransportClosed`] unless the client is open.
    pub fn send_event_async<C, F>(&self, message: Message, callback: F, context: C) -> Result<()>
    where
        C: Send + 'static,
        F: FnOnce(IotHubStatusCode, C) + Send + 'static,
    {
        self.queues
            .enqueue(OutboundPacket::new(message, callback, context))
    }

    /// Register the handler for cloud to device messages
    pub async fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&Message) -> MessageResult + Send + Sync + 'static,
    {
        self.transport
            .lock()
            .await
            .set_message_callback(Box::new(callback));
    }

    /// Stop the tasks, close the transport and report every message still
    /// waiting as cancelled
    pub async fn close(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.stop().await;
        }

        let closed = self.transport.lock().await.close().await;
        let flushed = self.queues.invoke_callbacks();
        if flushed > 0 {
            debug!("Flushed {} callbacks on close", flushed);
        }
        closed
    }
}
