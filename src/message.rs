use chrono::{DateTime, Utc};

/// Message used in body of communication
///
/// A message is immutable once built; transports only ever read it.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub(crate) body: Vec<u8>,
    pub(crate) properties: Vec<(String, String)>,
    pub(crate) message_id: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) content_encoding: Option<String>,
    pub(crate) expiry_time: Option<DateTime<Utc>>,
}

impl Message {
    /// Create with contents of body as message bytes
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Get a builder instance for building up a message
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Raw body bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Application properties in insertion order
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// Look up an application property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    ///
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    ///
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    ///
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    ///
    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    /// Absolute time after which the message should no longer be sent
    pub fn expiry_time(&self) -> Option<DateTime<Utc>> {
        self.expiry_time
    }

    /// Whether the message has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry_time, Some(expiry) if now >= expiry)
    }

    pub(crate) fn set_property(&mut self, key: String, value: String) {
        match self.properties.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.properties.push((key, value)),
        }
    }
}

/// Builder for constructing Message instances
#[derive(Debug, Default)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    /// Set the message body
    pub fn set_body(mut self, body: Vec<u8>) -> Self {
        self.message.body = body;
        self
    }

    /// Set the identifier for this message
    pub fn set_message_id(mut self, message_id: String) -> Self {
        self.message.message_id = Some(message_id);
        self
    }

    /// Set the correlation id, used to relate a response to its request
    pub fn set_correlation_id(mut self, correlation_id: String) -> Self {
        self.message.correlation_id = Some(correlation_id);
        self
    }

    /// Set the content-type for this message, such as `text/plain`.
    /// To allow routing query on the message body, this value should be set to `application/json`
    pub fn set_content_type(mut self, content_type: String) -> Self {
        self.message.content_type = Some(content_type);
        self
    }

    /// Set the content-encoding for this message.
    /// If the content-type is set to `application/json`, allowed values are `UTF-8`, `UTF-16`, `UTF-32`.
    pub fn set_content_encoding(mut self, content_encoding: String) -> Self {
        self.message.content_encoding = Some(content_encoding);
        self
    }

    /// Expire the message at an absolute time
    pub fn set_expiry_time(mut self, expiry: DateTime<Utc>) -> Self {
        self.message.expiry_time = Some(expiry);
        self
    }

    /// Add a message property; a repeated key replaces the earlier value
    pub fn add_message_property(mut self, key: String, value: String) -> Self {
        self.message.set_property(key, value);
        self
    }

    /// Build into a message instance
    pub fn build(self) -> Message {
        self.message
    }
}

/// Disposition returned by a message callback for a cloud to device message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageResult {
    /// The message was processed and can be removed from the device queue
    Complete,
    /// The message should be redelivered later
    Abandon,
    /// The message should be dead-lettered
    Reject,
}

/// Handler invoked for each cloud to device message
pub type MessageCallback = Box<dyn Fn(&Message) -> MessageResult + Send + Sync>;
