use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::*;
use mqtt::Encodable;
use mqtt::{QualityOfService, TopicFilter, TopicName};
use tokio::io::AsyncWriteExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_native_tls::{TlsConnector, TlsStream};

use crate::error::{Error, Result};
use crate::message::{Message, MessageCallback, MessageResult};
use crate::status::IotHubStatusCode;
use crate::token::TokenRenewal;
use crate::transport::{
    ensure_open, OutboundPacket, Protocol, Transport, TransportConfig, TransportQueues,
    TransportState,
};

const MQTT_PORT: u16 = 8883;
const KEEP_ALIVE: u16 = 10;
const SUBSCRIBE_PACKET_ID: u16 = 10;
const INBOUND_CAPACITY: usize = 16;

fn device_bound_messages_topic_filter(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/#", device_id)
}

fn device_bound_messages_topic_prefix(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/", device_id)
}

fn cloud_bound_messages_topic(device_id: &str) -> String {
    format!("devices/{}/messages/events/", device_id)
}

fn encode(packet: impl Into<VariablePacket>) -> Result<Vec<u8>> {
    let packet: VariablePacket = packet.into();
    let mut buf = Vec::new();
    packet
        .encode(&mut buf)
        .map_err(|e| Error::Protocol(format!("failed to encode packet: {:?}", e)))?;
    Ok(buf)
}

async fn tcp_connect(iot_hub: &str) -> Result<TlsStream<TcpStream>> {
    let socket = TcpStream::connect((iot_hub, MQTT_PORT)).await?;

    trace!("Connected to tcp socket {:?}", socket);

    let cx = TlsConnector::from(
        native_tls::TlsConnector::builder()
            .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
            .build()?,
    );

    let socket = cx.connect(iot_hub, socket).await?;

    trace!("Connected tls context {:?}", cx);

    Ok(socket)
}

async fn mqtt_connect(
    iot_hub: &str,
    device_id: &str,
    username: impl ToString,
    password: impl ToString,
) -> Result<TlsStream<TcpStream>> {
    let mut socket = tcp_connect(iot_hub).await?;

    let mut conn = ConnectPacket::new(device_id);
    conn.set_client_identifier(device_id);
    conn.set_clean_session(false);
    conn.set_keep_alive(KEEP_ALIVE);
    conn.set_user_name(Some(username.to_string()));
    conn.set_password(Some(password.to_string()));

    socket.write_all(&encode(conn)?).await?;

    let packet = VariablePacket::parse(&mut socket).await;

    trace!("PACKET {:?}", packet);
    match packet {
        Ok(VariablePacket::ConnackPacket(connack)) => match connack.connect_return_code() {
            ConnectReturnCode::ConnectionAccepted => Ok(socket),
            ConnectReturnCode::BadUserNameOrPassword | ConnectReturnCode::NotAuthorized => {
                Err(Error::Authentication(format!(
                    "broker refused credentials: {:?}",
                    connack.connect_return_code()
                )))
            }
            code => Err(Error::Protocol(format!(
                "failed to connect to server, return code {:?}",
                code
            ))),
        },
        Ok(pck) => Err(Error::Protocol(format!(
            "unexpected packet received after connect {:?}",
            pck
        ))),
        Err(err) => Err(Error::Protocol(format!(
            "error decoding connack packet {:?}",
            err
        ))),
    }
}

/// Topic for a device to cloud message with its properties appended
fn build_topic_name(base_topic: &TopicName, message: &Message) -> Result<TopicName> {
    let system_properties = [
        ("$.mid", message.message_id()),
        ("$.cid", message.correlation_id()),
        ("$.ct", message.content_type()),
        ("$.ce", message.content_encoding()),
    ];
    let system_properties = system_properties
        .iter()
        .filter_map(|(key, value)| value.map(|value| (*key, value)));
    let app_properties = message
        .properties()
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()));

    // if we reuse the base_topic string as the target for the serializer,
    // we end up with an extra ampersand before the key/value pairs
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(system_properties.chain(app_properties))
        .finish()
        // `+` is a topic wildcard; form encoding only emits it for spaces
        .replace('+', "%20");
    TopicName::new(format!("{}{}", base_topic.to_string(), encoded))
        .map_err(|e| Error::InvalidArgument(format!("invalid topic name: {:?}", e)))
}

/// Rebuild a cloud to device message from the property bag in its topic
fn parse_device_bound_message(prefix: &str, topic: &str, payload: &[u8]) -> Result<Message> {
    let properties = topic.trim_start_matches(prefix);
    let property_tuples = serde_urlencoded::from_str::<Vec<(String, String)>>(properties)
        .map_err(|e| Error::Protocol(format!("malformed topic properties: {}", e)))?;

    let mut message = Message::new(payload.to_vec());
    for (key, value) in property_tuples {
        match key.as_str() {
            "$.mid" => message.message_id = Some(value),
            "$.cid" => message.correlation_id = Some(value),
            "$.ct" => message.content_type = Some(value),
            "$.ce" => message.content_encoding = Some(value),
            // Other system properties such as $.to are routing details
            k if k.starts_with("$.") => (),
            _ => message.set_property(key, value),
        }
    }
    Ok(message)
}

async fn read_loop(
    mut read_socket: ReadHalf<TlsStream<TcpStream>>,
    rx_topic_prefix: String,
    handler_tx: Sender<Message>,
    lost: Arc<AtomicBool>,
) {
    loop {
        let packet = match VariablePacket::parse(&mut read_socket).await {
            Ok(pk) => pk,
            Err(err) => {
                error!("Error in receiving packet {}", err);
                break;
            }
        };

        trace!("Received PACKET {:?}", packet);
        match packet {
            VariablePacket::PingrespPacket(..) => {
                debug!("Receiving PINGRESP from broker ..");
            }
            VariablePacket::PublishPacket(ref publ)
                if publ.topic_name().starts_with(&rx_topic_prefix) =>
            {
                let message = match parse_device_bound_message(
                    &rx_topic_prefix,
                    publ.topic_name(),
                    &publ.payload_ref()[..],
                ) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropping cloud to device message: {}", e);
                        continue;
                    }
                };
                trace!("PUBLISH ({}): {:?}", publ.topic_name(), message);

                // The receiving end is gone once the transport closed
                if handler_tx.send(message).await.is_err() {
                    return;
                }
            }
            VariablePacket::SubackPacket(..) => debug!("Subscription acknowledged"),
            _ => {}
        }
    }

    lost.store(true, Ordering::SeqCst);
}

#[derive(Debug)]
struct Connection {
    write_socket: WriteHalf<TlsStream<TcpStream>>,
    reader: JoinHandle<()>,
    inbound: Receiver<Message>,
    lost: Arc<AtomicBool>,
    last_write: Instant,
}

impl Connection {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let written = self.write_socket.write_all(buf).await;
        if written.is_err() {
            self.lost.store(true, Ordering::SeqCst);
        }
        self.last_write = Instant::now();
        written.map_err(Error::from)
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst) || self.reader.is_finished()
    }
}

/// Device transport publishing with QoS 0 over MQTT
///
/// A publish that reaches the socket is reported as `Ok`; the broker sends
/// no acknowledgement at this quality of service.
pub struct MqttTransport {
    config: TransportConfig,
    token: TokenRenewal,
    queues: Arc<TransportQueues>,
    d2c_topic: TopicName,
    rx_topic_prefix: String,
    connection: Option<Connection>,
    message_callback: Option<MessageCallback>,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("hostname", &self.config.hostname)
            .field("device_id", &self.config.device_id)
            .field("connected", &self.connection.is_some())
            .field("queues", &self.queues)
            .finish()
    }
}

impl MqttTransport {
    ///
    pub fn new(config: TransportConfig) -> Result<Self> {
        let d2c_topic = TopicName::new(cloud_bound_messages_topic(&config.device_id))
            .map_err(|e| Error::InvalidArgument(format!("invalid device id: {:?}", e)))?;
        Ok(Self {
            token: TokenRenewal::new(config.token_source.clone(), config.token_validity),
            rx_topic_prefix: device_bound_messages_topic_prefix(&config.device_id),
            d2c_topic,
            config,
            queues: TransportQueues::new(),
            connection: None,
            message_callback: None,
        })
    }

    async fn connect(&mut self) -> Result<()> {
        let user_name = format!(
            "{}/{}/?api-version=2018-06-30",
            self.config.hostname, self.config.device_id
        );
        let token = self.token.token(Utc::now())?.to_string();

        let socket = mqtt_connect(
            &self.config.hostname,
            &self.config.device_id,
            user_name,
            token,
        )
        .await?;
        let (read_socket, write_socket) = tokio::io::split(socket);

        let (handler_tx, inbound) = channel(INBOUND_CAPACITY);
        let lost = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            read_socket,
            self.rx_topic_prefix.clone(),
            handler_tx,
            lost.clone(),
        ));

        let mut connection = Connection {
            write_socket,
            reader,
            inbound,
            lost,
            last_write: Instant::now(),
        };
        self.subscribe(&mut connection).await?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn subscribe(&self, connection: &mut Connection) -> Result<()> {
        let filter = TopicFilter::new(device_bound_messages_topic_filter(&self.config.device_id))
            .map_err(|e| Error::InvalidArgument(format!("invalid topic filter: {:?}", e)))?;
        let topics = vec![(filter, QualityOfService::Level0)];

        trace!("Subscribing to {:?}", topics);

        let subscribe_packet = SubscribePacket::new(SUBSCRIBE_PACKET_ID, topics);
        connection.write(&encode(subscribe_packet)?).await
    }

    /// Send DISCONNECT and stop the reader
    async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Ok(buf) = encode(DisconnectPacket::new()) {
                // If the connection is lost, there is nobody to tell
                let _ = connection.write(&buf).await;
            }
            let _ = connection.write_socket.shutdown().await;
            connection.reader.abort();
        }
    }

    async fn reconnect_if_needed(&mut self) -> Result<()> {
        let lost = self.connection.as_ref().map_or(true, Connection::is_lost);
        if !lost && !self.token.needs_renewal(Utc::now()) {
            return Ok(());
        }

        info!("Re-establishing MQTT connection for {}", self.config.device_id);
        self.disconnect().await;
        self.connect().await
    }

    async fn ping_if_idle(&mut self) -> Result<()> {
        let connection = match self.connection.as_mut() {
            Some(connection) => connection,
            None => return Ok(()),
        };
        if connection.last_write.elapsed() < Duration::from_secs(u64::from(KEEP_ALIVE / 2)) {
            return Ok(());
        }

        debug!("Sending PINGREQ to broker");
        connection.write(&encode(PingreqPacket::new())?).await
    }

    /// Encode a PUBLISH for each packet, completing the ones that cannot be sent
    fn prepare_publishes(
        &self,
        packets: Vec<OutboundPacket>,
        now: DateTime<Utc>,
    ) -> Vec<(OutboundPacket, Vec<u8>)> {
        let mut publishes = Vec::with_capacity(packets.len());
        for packet in packets {
            if packet.message().is_expired(now) {
                self.queues.complete(packet, IotHubStatusCode::MessageExpired);
                continue;
            }

            let encoded = build_topic_name(&self.d2c_topic, packet.message()).and_then(|topic| {
                trace!("Sending message {:?} to topic {:?}", packet.message(), topic);
                encode(PublishPacket::new(
                    topic,
                    QoSWithPacketIdentifier::Level0,
                    packet.message().body().to_vec(),
                ))
            });
            match encoded {
                Ok(buf) => publishes.push((packet, buf)),
                Err(e) => {
                    warn!("Cannot publish message: {}", e);
                    self.queues.complete(packet, IotHubStatusCode::BadFormat);
                }
            }
        }
        publishes
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
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
        match self.connect().await {
            Ok(()) => {
                self.queues.set_state(TransportState::Open);
                info!("MQTT transport open for {}", self.config.device_id);
                Ok(())
            }
            Err(e) => {
                error!("MQTT open failed: {}", e);
                self.disconnect().await;
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
        self.disconnect().await;
        self.token.invalidate();
        self.queues.set_state(TransportState::Closed);
        info!("MQTT transport closed for {}", self.config.device_id);
        Ok(())
    }

    async fn send_messages(&mut self) -> Result<()> {
        ensure_open(&self.queues, "mqtt transport")?;
        if self.queues.outbound_len() == 0 {
            return self.ping_if_idle().await;
        }
        self.reconnect_if_needed().await?;

        let publishes = self.prepare_publishes(self.queues.drain_outbound(), Utc::now());
        let mut publishes = publishes.into_iter();
        while let Some((packet, buf)) = publishes.next() {
            let connection = match self.connection.as_mut() {
                Some(connection) => connection,
                None => {
                    let rest = std::iter::once(packet).chain(publishes.map(|(packet, _)| packet));
                    self.queues.requeue_front(rest.collect());
                    return Err(Error::NotInitialized("mqtt connection"));
                }
            };
            match connection.write(&buf).await {
                Ok(()) => self.queues.complete(packet, IotHubStatusCode::Ok),
                Err(e) => {
                    self.queues.complete(packet, IotHubStatusCode::Error);
                    self.queues
                        .requeue_front(publishes.map(|(packet, _)| packet).collect());
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn handle_message(&mut self) -> Result<()> {
        let callback = match &self.message_callback {
            Some(callback) => callback,
            None => return Ok(()),
        };
        ensure_open(&self.queues, "mqtt transport")?;

        let message = match self.connection.as_mut() {
            Some(connection) => match connection.inbound.try_recv() {
                Ok(message) => message,
                Err(_) => return Ok(()),
            },
            None => return Ok(()),
        };

        match callback(&message) {
            MessageResult::Complete => trace!("Message completed"),
            // QoS 0 deliveries cannot be returned to the hub
            result => debug!("Discarding {:?} disposition for MQTT message", result),
        }
        Ok(())
    }
}
