//! Short-poll HTTPS transport
//!
//! Every tick drains the outbound queue into a single [`BatchMessage`] and
//! posts it; all messages in the batch share the response status.

pub mod batch;
#[cfg(feature = "https")]
pub mod hyper_client;
pub mod request;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use self::batch::{BatchMessage, APP_PROPERTY_PREFIX};
use self::request::{HttpsMethod, HttpsRequest, HttpsResponse, HttpsSender};
use crate::error::{Error, Result};
use crate::message::{Message, MessageCallback, MessageResult};
use crate::status::{map_status, IotHubStatusCode};
use crate::token::TokenRenewal;
use crate::transport::{
    ensure_open, OutboundPacket, Protocol, Transport, TransportConfig, TransportQueues,
    TransportState,
};

const API_VERSION: &str = "2016-11-14";
const BATCH_CONTENT_TYPE: &str = "application/vnd.microsoft.iothub.json";

fn events_url(hostname: &str, device_id: &str) -> String {
    format!(
        "https://{}/devices/{}/messages/events?api-version={}",
        hostname, device_id, API_VERSION
    )
}

fn device_bound_path(device_id: &str) -> String {
    format!("/devices/{}/messages/devicebound", device_id)
}

fn hub_error(response: &HttpsResponse) -> Result<()> {
    map_status(response.status(), Some(response.body())).map_err(Error::from)
}

/// Device transport speaking the hub's REST surface
pub struct HttpsTransport {
    config: TransportConfig,
    sender: Box<dyn HttpsSender>,
    token: TokenRenewal,
    queues: Arc<TransportQueues>,
    message_callback: Option<MessageCallback>,
}

impl std::fmt::Debug for HttpsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsTransport")
            .field("hostname", &self.config.hostname)
            .field("device_id", &self.config.device_id)
            .field("sender", &self.sender)
            .field("queues", &self.queues)
            .finish()
    }
}

impl HttpsTransport {
    ///
    pub fn new(config: TransportConfig, sender: Box<dyn HttpsSender>) -> Self {
        let token = TokenRenewal::new(config.token_source.clone(), config.token_validity);
        Self {
            config,
            sender,
            token,
            queues: TransportQueues::new(),
            message_callback: None,
        }
    }

    /// HTTPS transport using the bundled hyper client
    #[cfg(feature = "https")]
    pub fn with_hyper(config: TransportConfig) -> Self {
        Self::new(config, Box::new(hyper_client::HyperSender::new()))
    }

    fn request(&mut self, method: HttpsMethod, url: String, path: &str) -> Result<HttpsRequest> {
        let token = self.token.token(Utc::now())?.to_string();
        Ok(HttpsRequest::new(method, url)
            .header("authorization", token)
            .header("iothub-to", path)
            .header("user-agent", crate::USER_AGENT)
            .timeout(self.config.read_timeout))
    }

    /// Pack drained packets into one batch
    ///
    /// Packets that no longer fit go back to the head of the queue for the
    /// next tick. A packet too large to ever fit completes with
    /// `RequestEntityTooLarge`.
    fn build_batch(&self, packets: Vec<OutboundPacket>) -> (BatchMessage, Vec<OutboundPacket>) {
        let now = Utc::now();
        let mut batch = BatchMessage::with_limit(self.config.batch_limit);
        let mut batched = Vec::new();
        let mut leftover = Vec::new();

        let mut packets = packets.into_iter();
        while let Some(packet) = packets.next() {
            if packet.message().is_expired(now) {
                debug!("Message {:?} expired before sending", packet.message().message_id());
                self.queues.complete(packet, IotHubStatusCode::MessageExpired);
                continue;
            }
            match batch.add_message(packet.message()) {
                Ok(()) => batched.push(packet),
                Err(Error::BatchCapacity { size, limit }) if batched.is_empty() => {
                    warn!("Message of {} bytes can never fit a {} byte batch", size, limit);
                    self.queues
                        .complete(packet, IotHubStatusCode::RequestEntityTooLarge);
                }
                Err(Error::BatchCapacity { .. }) => {
                    leftover.push(packet);
                    leftover.extend(packets.by_ref());
                    break;
                }
                Err(e) => {
                    warn!("Could not serialize message: {}", e);
                    self.queues.complete(packet, IotHubStatusCode::Error);
                }
            }
        }

        self.queues.requeue_front(leftover);
        (batch, batched)
    }

    fn message_from_response(response: &HttpsResponse) -> Message {
        let mut message = Message::new(response.body().to_vec());
        for (name, value) in response.headers().iter() {
            if let Some(key) = name.strip_prefix(APP_PROPERTY_PREFIX) {
                message.set_property(key.to_owned(), value);
            }
        }
        message.message_id = response.header_field("iothub-messageid").ok();
        message.correlation_id = response.header_field("iothub-correlationid").ok();
        message
    }

    async fn settle(&mut self, etag: &str, result: MessageResult) -> Result<()> {
        let path = format!("{}/{}", device_bound_path(&self.config.device_id), etag);
        let (method, url) = match result {
            MessageResult::Complete => (
                HttpsMethod::Delete,
                format!("https://{}{}?api-version={}", self.config.hostname, path, API_VERSION),
            ),
            MessageResult::Abandon => (
                HttpsMethod::Post,
                format!(
                    "https://{}{}/abandon?api-version={}",
                    self.config.hostname, path, API_VERSION
                ),
            ),
            MessageResult::Reject => (
                HttpsMethod::Delete,
                format!(
                    "https://{}{}?reject&api-version={}",
                    self.config.hostname, path, API_VERSION
                ),
            ),
        };

        let request = self.request(method, url, &path)?;
        let response = self.sender.send(request).await?;
        hub_error(&response)
    }
}

#[async_trait]
impl Transport for HttpsTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Https
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
        // TLS is negotiated per request, there is no session to establish
        self.queues.set_state(TransportState::Opening);
        self.queues.set_state(TransportState::Open);
        info!("HTTPS transport open for {}", self.config.device_id);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.queues.state() == TransportState::Closed {
            return Ok(());
        }
        self.queues.begin_close();
        self.token.invalidate();
        self.queues.set_state(TransportState::Closed);
        info!("HTTPS transport closed for {}", self.config.device_id);
        Ok(())
    }

    async fn send_messages(&mut self) -> Result<()> {
        ensure_open(&self.queues, "https transport")?;

        let packets = self.queues.drain_outbound();
        if packets.is_empty() {
            return Ok(());
        }

        let (batch, batched) = self.build_batch(packets);
        if batched.is_empty() {
            return Ok(());
        }

        let url = events_url(&self.config.hostname, &self.config.device_id);
        let path = format!("/devices/{}/messages/events", self.config.device_id);
        let request = match self.request(HttpsMethod::Post, url, &path) {
            Ok(request) => request,
            Err(e) => {
                self.queues
                    .complete_all(batched, IotHubStatusCode::Unauthorized);
                return Err(e);
            }
        };
        let body = batch.body();
        trace!("Sending batch of {} messages: {}", batched.len(), body);
        let request = request
            .header("content-type", BATCH_CONTENT_TYPE)
            .body(body.into_bytes());

        match self.sender.send(request).await {
            Ok(response) => {
                let status = IotHubStatusCode::from_http_status(response.status());
                if let Err(e) = hub_error(&response) {
                    warn!("Hub rejected batch of {}: {}", batched.len(), e);
                }
                self.queues.complete_all(batched, status);
                Ok(())
            }
            Err(e) => {
                self.queues.complete_all(batched, IotHubStatusCode::Error);
                Err(e)
            }
        }
    }

    async fn handle_message(&mut self) -> Result<()> {
        if self.message_callback.is_none() {
            return Ok(());
        }
        ensure_open(&self.queues, "https transport")?;

        let path = device_bound_path(&self.config.device_id);
        let url = format!(
            "https://{}{}?api-version={}",
            self.config.hostname, path, API_VERSION
        );
        let request = self.request(HttpsMethod::Get, url, &path)?;
        let response = self.sender.send(request).await?;
        hub_error(&response)?;
        if response.status() == 204 {
            return Ok(());
        }

        let etag = response.header_field("etag")?;
        let etag = etag.trim_matches('"').to_owned();
        let message = Self::message_from_response(&response);
        trace!("Received cloud to device message {:?}", message);

        let result = match &self.message_callback {
            Some(callback) => callback(&message),
            None => return Ok(()),
        };
        debug!("Settling message {} as {:?}", etag, result);

        self.settle(&etag, result).await
    }
}
