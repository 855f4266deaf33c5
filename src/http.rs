use crate::error::{ApiError, TransportError};
use anyhow::Result;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_rustls::HttpsConnector;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub use hyper::Method;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Returns a copy carrying `token` as the only Authorization header.
    pub fn with_bearer(&self, token: &str) -> Self {
        let mut req = self.clone();
        req.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("authorization"));
        req.header("Authorization", format!("Bearer {}", token))
    }

    pub fn json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, ApiError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| ApiError::Other(format!("Failed to encode request body: {}", e)))?;
        let mut req = self.header("Content-Type", "application/json");
        req.body = Some(bytes);
        Ok(req)
    }

    pub fn form(self, pairs: &[(&str, &str)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        let mut req = self.header("Content-Type", "application/x-www-form-urlencoded");
        req.body = Some(encoded.into_bytes());
        req
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::Other(format!("Failed to parse response: {}", e)))
    }
}

/// Sends one HTTP request. Implementations do not retry.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production transport over hyper with rustls and the platform trust store.
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .build();
        Ok(Self {
            client: Client::builder().build(connector),
            timeout,
        })
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = hyper::Request::builder()
            .method(request.method)
            .uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let body = request.body.map(Body::from).unwrap_or_else(Body::empty);
        let req = builder
            .body(body)
            .map_err(|e| TransportError::Invalid(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status().as_u16();
        let bytes = tokio::time::timeout(self.timeout, hyper::body::to_bytes(response.into_body()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(HttpResponse {
            status,
            body: bytes.to_vec(),
        })
    }
}

/// Answers whether the machine currently has network access.
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

pub struct AlwaysOnline;

#[async_trait]
impl Connectivity for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Considers the machine online when a TCP connection to `addr` succeeds.
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connectivity for TcpProbe {
    async fn is_online(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(self.addr.as_str())).await,
            Ok(Ok(_))
        )
    }
}
