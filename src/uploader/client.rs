// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use thiserror::Error;
use tower::BoxError;

use super::request::{parse_ack, UploadRequest};
use crate::tailer::FileId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unable to connect")]
    Connect,

    #[error("request failed: {0}")]
    Request(String),
}

/// What came back from the backend. Non-2xx responses carry no committed
/// offsets; the retry policy decides what to do with the status.
#[derive(Debug)]
pub struct UploadResponse {
    pub status: u16,
    pub committed: HashMap<FileId, u64>,
}

impl UploadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The transport seam: the uploader only sees this trait, so tests swap
/// the HTTPS client for an in-process fake.
pub trait Transport: Send + Sync {
    fn send(&self, request: UploadRequest) -> BoxFuture<'_, Result<UploadResponse, TransportError>>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, request: UploadRequest) -> BoxFuture<'_, Result<UploadResponse, TransportError>> {
        (**self).send(request)
    }
}

/// HTTPS transport over a pooled hyper client.
pub struct HttpsTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    endpoint: Uri,
    api_token: String,
}

impl HttpsTransport {
    pub fn new(endpoint: &str, api_token: impl Into<String>) -> Result<Self, BoxError> {
        let endpoint: Uri = endpoint.parse()?;

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .timer(TokioTimer::new())
            .build::<_, Full<Bytes>>(https);

        Ok(Self {
            client,
            endpoint,
            api_token: api_token.into(),
        })
    }

    async fn perform(&self, request: UploadRequest) -> Result<UploadResponse, TransportError> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip");
        if !self.api_token.is_empty() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", self.api_token));
        }
        let req = builder
            .body(Full::new(request.body))
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let resp = match self.client.request(req).await {
            Err(e) if e.is_connect() => return Err(TransportError::Connect),
            Err(e) => return Err(TransportError::Request(e.to_string())),
            Ok(resp) => resp,
        };

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Ok(UploadResponse {
                status,
                committed: HashMap::new(),
            });
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Request(format!("failed reading response: {}", e)))?
            .to_bytes();

        // A success without a readable acknowledgment is not a success we
        // can act on; surface it as a request failure so it retries.
        let committed = parse_ack(&body)
            .map_err(|e| TransportError::Request(format!("malformed acknowledgment: {}", e)))?;

        Ok(UploadResponse { status, committed })
    }
}

impl Transport for HttpsTransport {
    fn send(&self, request: UploadRequest) -> BoxFuture<'_, Result<UploadResponse, TransportError>> {
        Box::pin(self.perform(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_endpoint() {
        assert!(HttpsTransport::new("not a uri", "").is_err());
    }

    #[test]
    fn accepts_https_endpoint() {
        let transport = HttpsTransport::new("https://ingest.example.com/api/uploadLogs", "tok");
        assert!(transport.is_ok());
    }
}
