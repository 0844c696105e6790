//! Service side receiver for delivery feedback
//!
//! Devices acknowledge cloud to device messages; the hub batches those
//! acknowledgements and offers them on `/messages/servicebound/feedback`.
//! [`FeedbackReceiver::receive`] turns the reactor's pushes into a pull with
//! an optional timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Semaphore;

use super::{
    AmqpConnectOptions, AmqpEndpoint, AmqpEvent, AmqpEventHandler, AmqpLink, AmqpMessage,
    DeliveryOutcome, LinkRole, LinkSpec, Reactor,
};
use crate::error::{Error, Result};
use crate::token::{ServiceSasTokenSource, TokenRenewal, DEFAULT_SERVICE_TOKEN_VALIDITY_SECS};
use crate::transport::TransportState;

/// Address the hub publishes feedback on
pub const FEEDBACK_ADDRESS: &str = "/messages/servicebound/feedback";

/// Outcome a device reported for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FeedbackStatusCode {
    ///
    Success,
    ///
    Expired,
    ///
    DeliveryCountExceeded,
    ///
    Rejected,
    /// Anything the hub adds later
    #[serde(other)]
    Unknown,
}

/// Acknowledgement for a single cloud to device message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    ///
    pub original_message_id: Option<String>,
    ///
    #[serde(default)]
    pub correlation_id: Option<String>,
    ///
    #[serde(default)]
    pub description: Option<String>,
    ///
    #[serde(default)]
    pub device_generation_id: Option<String>,
    ///
    pub device_id: String,
    ///
    pub enqueued_time_utc: DateTime<Utc>,
    ///
    pub status_code: FeedbackStatusCode,
}

/// Feedback records delivered together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackBatch {
    /// Enqueue time of the most recent record
    pub enqueued_time_utc: Option<DateTime<Utc>>,
    ///
    pub user_id: Option<String>,
    /// Delivery tag the batch arrived with
    pub lock_token: u64,
    ///
    pub records: Vec<FeedbackRecord>,
}

impl FeedbackBatch {
    /// Parse the JSON array carried in a feedback delivery
    pub fn parse(lock_token: u64, message: &AmqpMessage) -> Result<Self> {
        let records: Vec<FeedbackRecord> = serde_json::from_slice(&message.body)?;
        let enqueued_time_utc = records.iter().map(|r| r.enqueued_time_utc).max();

        Ok(Self {
            enqueued_time_utc,
            user_id: message.user_id.clone(),
            lock_token,
            records,
        })
    }
}

#[derive(Debug)]
struct FeedbackHandler {
    state: Mutex<TransportState>,
    ready: Mutex<VecDeque<FeedbackBatch>>,
    settlements: Mutex<Vec<(u64, DeliveryOutcome)>>,
    available: Semaphore,
    lost: AtomicBool,
}

impl FeedbackHandler {
    fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Opening),
            ready: Mutex::new(VecDeque::new()),
            settlements: Mutex::new(Vec::new()),
            available: Semaphore::new(0),
            lost: AtomicBool::new(false),
        }
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn take_settlements(&self) -> Vec<(u64, DeliveryOutcome)> {
        std::mem::take(&mut *self.settlements.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn next_batch(&self) -> Option<FeedbackBatch> {
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

impl AmqpEventHandler for FeedbackHandler {
    fn on_event(&self, event: AmqpEvent) {
        match event {
            AmqpEvent::ConnectionInit => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if *state == TransportState::Opening {
                    *state = TransportState::Open;
                    info!("Feedback receiver connected");
                }
            }
            AmqpEvent::MessageReceived {
                delivery_tag,
                message,
                ..
            } => {
                let parsed = FeedbackBatch::parse(delivery_tag, &message);
                let outcome = match &parsed {
                    Ok(batch) => {
                        debug!("Feedback batch with {} records", batch.records.len());
                        DeliveryOutcome::Accepted
                    }
                    Err(e) => {
                        warn!("Malformed feedback payload: {}", e);
                        DeliveryOutcome::Rejected {
                            description: Some(e.to_string()),
                        }
                    }
                };
                // Settlement is queued before the waiter can wake
                self.settlements
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((delivery_tag, outcome));
                if let Ok(batch) = parsed {
                    self.ready
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back(batch);
                    self.available.add_permits(1);
                }
            }
            AmqpEvent::ConnectionClosed { error } => {
                warn!("Feedback connection lost: {:?}", error);
                self.lost.store(true, Ordering::SeqCst);
            }
            AmqpEvent::Delivered { delivery_tag, .. } => {
                trace!("Ignoring outcome for delivery {}", delivery_tag)
            }
        }
    }
}

/// Pulls delivery feedback for the whole hub
#[derive(Debug)]
pub struct FeedbackReceiver {
    hostname: String,
    key_name: String,
    endpoint: Arc<dyn AmqpEndpoint>,
    token: TokenRenewal,
    handler: Option<Arc<FeedbackHandler>>,
    reactor: Option<Reactor>,
    link: Option<Box<dyn AmqpLink>>,
}

impl FeedbackReceiver {
    /// Receiver authenticating with the shared access policy `key_name`
    pub fn new(
        hostname: &str,
        key_name: &str,
        key: &str,
        endpoint: Arc<dyn AmqpEndpoint>,
    ) -> Result<Self> {
        let source = ServiceSasTokenSource::new(hostname, key_name, key)?;
        Ok(Self {
            hostname: hostname.to_owned(),
            key_name: key_name.to_owned(),
            endpoint,
            token: TokenRenewal::new(
                Arc::new(source),
                chrono::Duration::seconds(DEFAULT_SERVICE_TOKEN_VALIDITY_SECS),
            ),
            handler: None,
            reactor: None,
            link: None,
        })
    }

    ///
    pub fn state(&self) -> TransportState {
        self.handler
            .as_ref()
            .map_or(TransportState::Closed, |handler| handler.state())
    }

    fn hub_name(&self) -> &str {
        self.hostname.split('.').next().unwrap_or(&self.hostname)
    }

    async fn connect(&mut self, handler: Arc<FeedbackHandler>) -> Result<()> {
        let options = AmqpConnectOptions {
            hostname: self.hostname.clone(),
            user_name: format!("{}@sas.root.{}", self.key_name, self.hub_name()),
            password: self.token.token(Utc::now())?.to_string(),
            links: vec![LinkSpec {
                address: FEEDBACK_ADDRESS.to_owned(),
                role: LinkRole::Receiver,
            }],
        };

        let (link, events) = self.endpoint.connect(options).await?;
        handler.lost.store(false, Ordering::SeqCst);
        self.reactor = Some(Reactor::spawn(events, handler));
        self.link = Some(link);
        Ok(())
    }

    /// Start the connection; it counts as open once the reactor reports it
    pub async fn open(&mut self) -> Result<()> {
        if self.handler.is_some() {
            return Ok(());
        }
        let handler = Arc::new(FeedbackHandler::new());
        self.connect(handler.clone()).await?;
        self.handler = Some(handler);
        Ok(())
    }

    /// Wait for the next feedback batch
    ///
    /// A `timeout_ms` of zero waits without bound. Returns `None` when the
    /// wait times out.
    pub async fn receive(
        &mut self,
        device_id: &str,
        timeout_ms: u64,
    ) -> Result<Option<FeedbackBatch>> {
        let handler = match &self.handler {
            Some(handler) => handler.clone(),
            None => return Err(Error::NotInitialized("feedback receiver")),
        };
        debug!("Receiving feedback for {}", device_id);

        let running = self.reactor.as_ref().map_or(false, Reactor::is_running);
        if !running || handler.lost.load(Ordering::SeqCst) {
            info!("Restarting feedback connection");
            self.release_connection().await;
            self.connect(handler.clone()).await?;
        }

        let acquired = if timeout_ms == 0 {
            Some(handler.available.acquire().await)
        } else {
            tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                handler.available.acquire(),
            )
            .await
            .ok()
        };

        self.flush_settlements(&handler).await?;

        match acquired {
            Some(Ok(permit)) => {
                permit.forget();
                Ok(handler.next_batch())
            }
            Some(Err(_)) => Err(Error::TransportClosed),
            None => {
                trace!("No feedback within {} ms", timeout_ms);
                Ok(None)
            }
        }
    }

    async fn flush_settlements(&mut self, handler: &FeedbackHandler) -> Result<()> {
        let settlements = handler.take_settlements();
        if settlements.is_empty() {
            return Ok(());
        }
        let link = self
            .link
            .as_mut()
            .ok_or(Error::NotInitialized("feedback link"))?;
        for (delivery_tag, outcome) in settlements {
            link.settle(delivery_tag, outcome).await?;
        }
        Ok(())
    }

    async fn release_connection(&mut self) {
        if let Some(reactor) = self.reactor.take() {
            reactor.stop();
        }
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close().await {
                warn!("Error closing feedback link: {}", e);
            }
        }
    }

    /// Detach the handler and drop the connection
    pub async fn close(&mut self) -> Result<()> {
        let handler = match self.handler.take() {
            Some(handler) => handler,
            None => return Ok(()),
        };
        handler.set_state(TransportState::Closing);
        self.release_connection().await;
        handler.available.close();
        handler.set_state(TransportState::Closed);
        info!("Feedback receiver closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::{wait_until, MockEndpoint};
    use super::*;

    const KEY: &str = "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=";

    const PAYLOAD: &str = r#"[
        {"originalMessageId":"m-1","description":"Success","deviceGenerationId":"g","deviceId":"device-1","enqueuedTimeUtc":"2016-05-04T10:00:00Z","statusCode":"Success"},
        {"originalMessageId":"m-2","description":"Message expired","deviceId":"device-2","enqueuedTimeUtc":"2016-05-04T10:05:00Z","statusCode":"Expired"}
    ]"#;

    fn receiver(endpoint: &MockEndpoint) -> FeedbackReceiver {
        FeedbackReceiver::new(
            "HubName.azure-devices.net",
            "service",
            KEY,
            Arc::new(endpoint.clone()),
        )
        .unwrap()
    }

    fn feedback(tag: u64, body: &str) -> AmqpEvent {
        AmqpEvent::MessageReceived {
            delivery_tag: tag,
            address: FEEDBACK_ADDRESS.to_owned(),
            message: AmqpMessage {
                body: body.as_bytes().to_vec(),
                user_id: Some("iothub".to_owned()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn parse_records() {
        let message = AmqpMessage {
            body: PAYLOAD.as_bytes().to_vec(),
            ..Default::default()
        };
        let batch = FeedbackBatch::parse(3, &message).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].status_code, FeedbackStatusCode::Success);
        assert_eq!(batch.records[1].status_code, FeedbackStatusCode::Expired);
        assert_eq!(batch.records[1].device_id, "device-2");
        assert_eq!(
            batch.enqueued_time_utc.unwrap().to_rfc3339(),
            "2016-05-04T10:05:00+00:00"
        );
        assert_eq!(batch.lock_token, 3);
    }

    #[tokio::test]
    async fn receive_before_open_fails() {
        let endpoint = MockEndpoint::new();
        let mut receiver = receiver(&endpoint);
        assert!(matches!(
            receiver.receive("device-1", 10).await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn open_connects_with_service_credentials() {
        let endpoint = MockEndpoint::new();
        let mut receiver = receiver(&endpoint);
        receiver.open().await.unwrap();
        assert!(wait_until(|| receiver.state() == TransportState::Open).await);

        let recorded = endpoint.recorded.lock().unwrap();
        let options = &recorded.connects[0];
        assert_eq!(options.user_name, "service@sas.root.HubName");
        assert!(options.password.contains("sr=hubname.azure-devices.net"));
        assert!(options.password.ends_with("&skn=service"));
        assert_eq!(options.links[0].address, FEEDBACK_ADDRESS);
    }

    #[tokio::test]
    async fn receive_returns_parsed_batch_and_accepts_it() {
        let endpoint = MockEndpoint::new();
        let mut receiver = receiver(&endpoint);
        receiver.open().await.unwrap();
        endpoint.inject(feedback(7, PAYLOAD));

        let batch = receiver.receive("device-1", 1000).await.unwrap().unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.user_id.as_deref(), Some("iothub"));
        assert_eq!(
            endpoint.recorded.lock().unwrap().settled,
            vec![(7, DeliveryOutcome::Accepted)]
        );
    }

    #[tokio::test]
    async fn receive_times_out_and_rejects_malformed_payload() {
        let endpoint = MockEndpoint::new();
        let mut receiver = receiver(&endpoint);
        receiver.open().await.unwrap();
        endpoint.inject(feedback(8, "not json"));

        assert_eq!(receiver.receive("device-1", 50).await.unwrap(), None);
        let settled = endpoint.recorded.lock().unwrap().settled.clone();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].0, 8);
        assert!(matches!(settled[0].1, DeliveryOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn zero_timeout_waits_for_delayed_feedback() {
        let endpoint = MockEndpoint::new();
        let mut receiver = receiver(&endpoint);
        receiver.open().await.unwrap();

        let sender = endpoint.sender().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = sender.send(feedback(1, PAYLOAD));
        });

        let batch = receiver.receive("device-1", 0).await.unwrap();
        assert!(batch.is_some());
    }

    #[tokio::test]
    async fn events_after_close_are_ignored() {
        let endpoint = MockEndpoint::new();
        let mut receiver = receiver(&endpoint);
        receiver.open().await.unwrap();
        let sender = endpoint.sender().unwrap();

        receiver.close().await.unwrap();
        assert_eq!(receiver.state(), TransportState::Closed);
        assert_eq!(endpoint.recorded.lock().unwrap().closed, 1);

        let _ = sender.send(feedback(2, PAYLOAD));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(endpoint.recorded.lock().unwrap().settled.is_empty());
        assert!(matches!(
            receiver.receive("device-1", 10).await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn lost_connection_is_restarted_on_receive() {
        let endpoint = MockEndpoint::new();
        let mut receiver = receiver(&endpoint);
        receiver.open().await.unwrap();
        endpoint.inject(AmqpEvent::ConnectionClosed { error: None });
        let handler = receiver.handler.clone().unwrap();
        assert!(wait_until(|| handler.lost.load(Ordering::SeqCst)).await);

        assert_eq!(receiver.receive("device-1", 10).await.unwrap(), None);
        assert_eq!(endpoint.recorded.lock().unwrap().connects.len(), 2);
    }
}
