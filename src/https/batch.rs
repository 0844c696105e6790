//! JSON batch body for the HTTPS events endpoint

use std::borrow::Cow;

use serde::{Serialize, Serializer};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::DEFAULT_BATCH_LIMIT;

/// Prefix marking application properties on the wire
pub const APP_PROPERTY_PREFIX: &str = "iothub-app-";

#[derive(Serialize)]
struct SingleMessageJson<'a> {
    body: Cow<'a, str>,
    #[serde(rename = "base64Encoded")]
    base64_encoded: bool,
    #[serde(serialize_with = "serialize_app_properties")]
    properties: &'a [(String, String)],
}

fn serialize_app_properties<S>(
    properties: &&[(String, String)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(
        properties
            .iter()
            .map(|(k, v)| (format!("{}{}", APP_PROPERTY_PREFIX, k), v)),
    )
}

impl<'a> From<&'a Message> for SingleMessageJson<'a> {
    fn from(message: &'a Message) -> Self {
        let (body, base64_encoded) = match std::str::from_utf8(message.body()) {
            Ok(text) => (Cow::Borrowed(text), false),
            Err(_) => (Cow::Owned(base64::encode(message.body())), true),
        };
        Self {
            body,
            base64_encoded,
            properties: message.properties(),
        }
    }
}

/// Several messages serialized into one HTTPS request body
///
/// The body is a JSON array of
/// `{"body":..,"base64Encoded":..,"properties":{"iothub-app-<key>":..}}`.
#[derive(Debug, Clone)]
pub struct BatchMessage {
    elements: Vec<String>,
    limit: usize,
}

impl Default for BatchMessage {
    fn default() -> Self {
        Self::with_limit(DEFAULT_BATCH_LIMIT)
    }
}

impl BatchMessage {
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch whose serialized body may not exceed `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            elements: Vec::new(),
            limit,
        }
    }

    /// Serialized size in bytes: brackets, elements and separating commas
    pub fn size(&self) -> usize {
        Self::size_of(&self.elements)
    }

    fn size_of(elements: &[String]) -> usize {
        let content: usize = elements.iter().map(String::len).sum();
        2 + content + elements.len().saturating_sub(1)
    }

    /// Append a message, or fail without changing the batch if it would not fit
    pub fn add_message(&mut self, message: &Message) -> Result<()> {
        let element = serde_json::to_string(&SingleMessageJson::from(message))?;

        let separator = if self.elements.is_empty() { 0 } else { 1 };
        let size = self.size() + separator + element.len();
        if size > self.limit {
            return Err(Error::BatchCapacity {
                size,
                limit: self.limit,
            });
        }

        self.elements.push(element);
        Ok(())
    }

    ///
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    ///
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The JSON array, without insignificant whitespace
    pub fn body(&self) -> String {
        format!("[{}]", self.elements.join(","))
    }
}
