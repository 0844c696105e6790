//! Protocol neutral HTTPS request and response, and the sender seam

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::transport::DEFAULT_READ_TIMEOUT;

/// Methods used against the hub REST surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpsMethod {
    ///
    Get,
    ///
    Post,
    ///
    Delete,
}

/// Header fields keyed case-insensitively
///
/// Repeated fields keep every value; lookups join them with `,`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    fields: HashMap<String, Vec<String>>,
}

impl HeaderFields {
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for `name`
    pub fn insert(&mut self, name: &str, value: &str) {
        self.fields
            .entry(name.to_ascii_lowercase())
            .or_insert_with(Vec::new)
            .push(value.to_owned());
    }

    /// All values for `name` joined with `,`
    pub fn get(&self, name: &str) -> Result<String> {
        self.fields
            .get(&name.to_ascii_lowercase())
            .map(|values| values.join(","))
            .ok_or_else(|| Error::InvalidArgument(format!("no header field named {}", name)))
    }

    /// Field names (lower-cased) with their joined values
    pub fn iter(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.fields
            .iter()
            .map(|(name, values)| (name.as_str(), values.join(",")))
    }
}

/// A request to the hub
#[derive(Debug, Clone)]
pub struct HttpsRequest {
    pub(crate) method: HttpsMethod,
    pub(crate) url: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
    pub(crate) timeout: Duration,
}

impl HttpsRequest {
    ///
    pub fn new(method: HttpsMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    ///
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    ///
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    ///
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    ///
    pub fn method(&self) -> HttpsMethod {
        self.method
    }

    ///
    pub fn url(&self) -> &str {
        &self.url
    }

    ///
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    ///
    pub fn request_body(&self) -> &[u8] {
        &self.body
    }
}

/// A response from the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpsResponse {
    status: u16,
    headers: HeaderFields,
    body: Vec<u8>,
}

impl HttpsResponse {
    ///
    pub fn new(status: u16, headers: HeaderFields, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    ///
    pub fn status(&self) -> u16 {
        self.status
    }

    ///
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Value of a header field, looked up case-insensitively
    pub fn header_field(&self, name: &str) -> Result<String> {
        self.headers.get(name)
    }

    ///
    pub fn headers(&self) -> &HeaderFields {
        &self.headers
    }
}

/// Performs one HTTPS exchange; each call negotiates its own TLS session
#[async_trait]
pub trait HttpsSender: Send + Sync + std::fmt::Debug {
    ///
    async fn send(&self, request: HttpsRequest) -> Result<HttpsResponse>;
}
