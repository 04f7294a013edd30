//! The HTTP collaborator: a trait for issuing one HTTPS request, the wire
//! types it exchanges, and credential handling.
//!
//! The pipeline owns retries, timeouts, and rate limiting; an
//! [`HttpClient`] implementation only has to perform a single exchange. A
//! default implementation over `reqwest` ships behind the
//! `reqwest-client` feature.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{Method, StatusCode};

use crate::config::PRECISION_HEADER;
use crate::error::ConfigError;
use crate::request::Request;

/// A single outgoing HTTP exchange, fully assembled.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// The raw result of an exchange, body fully read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Transport-level failure: the exchange never produced a status line.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("exchange failed: {0}")]
    Io(String),
}

impl TransportError {
    pub(crate) fn message(&self) -> String {
        match self {
            Self::Connect(m) | Self::Io(m) => m.clone(),
        }
    }
}

/// Issues one HTTPS request and returns the response.
///
/// Implementations must be safe to share across the pipeline's concurrent
/// send lanes; connection pooling is their concern.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn perform(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Credentials for the `Authorization` header.
#[derive(Clone)]
pub enum Token {
    Bot(String),
    Bearer(String),
}

impl Token {
    fn header_value(&self) -> Result<HeaderValue, ConfigError> {
        let raw = match self {
            Self::Bot(token) => format!("Bot {}", token),
            Self::Bearer(token) => format!("Bearer {}", token),
        };
        let mut value = HeaderValue::from_str(&raw).map_err(|_| ConfigError::InvalidToken)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

// The token must never appear in logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bot(_) => f.write_str("Token::Bot(<redacted>)"),
            Self::Bearer(_) => f.write_str("Token::Bearer(<redacted>)"),
        }
    }
}

/// Pre-validated wire defaults applied to every outgoing request.
#[derive(Debug, Clone)]
pub(crate) struct Wire {
    auth: HeaderValue,
    user_agent: HeaderValue,
    base_url: String,
    precision: bool,
}

impl Wire {
    pub fn new(
        token: &Token,
        base_url: &str,
        millisecond_precision: bool,
    ) -> Result<Self, ConfigError> {
        let user_agent = format!(
            "DiscordBot ({}, {})",
            env!("CARGO_PKG_REPOSITORY"),
            env!("CARGO_PKG_VERSION")
        );
        Ok(Self {
            auth: token.header_value()?,
            user_agent: HeaderValue::from_str(&user_agent)
                .map_err(|_| ConfigError::InvalidToken)?,
            base_url: base_url.trim_end_matches('/').to_owned(),
            precision: millisecond_precision,
        })
    }

    /// Assemble the outgoing exchange for a request. The request's extra
    /// headers win over the defaults set here.
    pub fn build<D, C>(&self, request: &Request<D, C>) -> HttpRequest {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.auth.clone());
        headers.insert(USER_AGENT, self.user_agent.clone());
        if self.precision {
            headers.insert(
                HeaderName::from_static(PRECISION_HEADER),
                HeaderValue::from_static("millisecond"),
            );
        }
        if request.body_bytes().is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        for (name, value) in request.extra_headers() {
            headers.insert(name.clone(), value.clone());
        }
        HttpRequest {
            method: request.route().method().clone(),
            url: format!("{}{}", self.base_url, request.route().path()),
            headers,
            body: request.body_bytes().cloned(),
        }
    }
}

#[cfg(feature = "reqwest-client")]
pub use self::reqwest_client::ReqwestClient;

#[cfg(feature = "reqwest-client")]
mod reqwest_client {
    use super::*;

    /// [`HttpClient`] over a shared [`reqwest::Client`] connection pool.
    ///
    /// Built without a client-side timeout; the pipeline applies its own
    /// `http_timeout` around every exchange.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestClient {
        inner: reqwest::Client,
    }

    impl ReqwestClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_client(inner: reqwest::Client) -> Self {
            Self { inner }
        }
    }

    #[async_trait]
    impl HttpClient for ReqwestClient {
        async fn perform(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let mut builder = self
                .inner
                .request(request.method, &request.url)
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            let response = builder.send().await.map_err(|e| {
                if e.is_connect() {
                    TransportError::Connect(e.to_string())
                } else {
                    TransportError::Io(e.to_string())
                }
            })?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            Ok(HttpResponse { status, headers, body })
        }
    }
}
