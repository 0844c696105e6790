//! Production [`HttpsSender`] on hyper

use async_trait::async_trait;
use hyper::{client::HttpConnector, Body, Client, Method, Request};
use hyper_tls::HttpsConnector;

use super::request::{HeaderFields, HttpsMethod, HttpsRequest, HttpsResponse, HttpsSender};
use crate::error::{Error, Result};

/// [`HttpsSender`] backed by a hyper client with native TLS
#[derive(Debug, Clone)]
pub struct HyperSender {
    client: Client<HttpsConnector<HttpConnector>>,
}

impl Default for HyperSender {
    fn default() -> Self {
        let https = HttpsConnector::new();
        let client = Client::builder().build::<_, hyper::Body>(https);
        Self { client }
    }
}

impl HyperSender {
    ///
    pub fn new() -> Self {
        Self::default()
    }
}

impl HyperSender {
    async fn exchange(&self, req: Request<Body>) -> Result<HttpsResponse> {
        let res = self.client.request(req).await?;

        let status = res.status().as_u16();
        let mut headers = HeaderFields::new();
        for (name, value) in res.headers() {
            headers.insert(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
        }
        let body = hyper::body::to_bytes(res.into_body()).await?;

        debug!("Response: {}", status);

        Ok(HttpsResponse::new(status, headers, body.to_vec()))
    }
}

#[async_trait]
impl HttpsSender for HyperSender {
    async fn send(&self, request: HttpsRequest) -> Result<HttpsResponse> {
        let method = match request.method {
            HttpsMethod::Get => Method::GET,
            HttpsMethod::Post => Method::POST,
            HttpsMethod::Delete => Method::DELETE,
        };

        let mut builder = Request::builder().method(method).uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let req = builder
            .body(Body::from(request.body))
            .map_err(|e| Error::InvalidArgument(format!("malformed request: {}", e)))?;

        // The timeout covers the body as well as the response head
        tokio::time::timeout(request.timeout, self.exchange(req)).await?
    }
}
