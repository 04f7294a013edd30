//! Error types surfaced by the request pipeline.

use std::fmt;
use std::time::Duration;

use http::StatusCode;

/// Why a request produced an [`Error`](crate::Answer::Error) answer instead
/// of a response.
///
/// A 429 is deliberately absent here: the server rejecting an admitted
/// request is reported through [`Answer::Ratelimited`](crate::Answer), not as
/// an error.
#[derive(Debug, Clone)]
pub enum ErrorCause {
    /// Connection, DNS, or TLS failure while talking to the endpoint.
    Network { message: String },
    /// The server answered with a non-2xx, non-429 status.
    HttpStatus { status: StatusCode, body: String },
    /// The HTTP call did not complete within `http_timeout`.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The response body could not be decoded by the request's parser.
    Parse(ParseError),
    /// The ingress buffer's overflow policy rejected this request.
    BufferOverflow,
    /// A 204 arrived for a request whose parser requires a body.
    UnexpectedEmpty,
    /// The pipeline tore down before this request completed.
    PipelineShutdown,
}

impl ErrorCause {
    /// Whether the retry loop may re-inject a request that failed this way.
    ///
    /// Network failures and timeouts are transient. Server statuses retry
    /// only for 5xx and 408; a 4xx is the caller's problem. Everything else
    /// is deterministic and retrying would just repeat the failure.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Parse(_)
            | Self::BufferOverflow
            | Self::UnexpectedEmpty
            | Self::PipelineShutdown => false,
        }
    }

    /// Check if this is a transport-level failure.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Check if this is an HTTP timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this is a non-2xx status answer.
    pub fn is_http_status(&self) -> bool {
        matches!(self, Self::HttpStatus { .. })
    }

    /// Check if this is a body-decoding failure.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }

    /// Check if the ingress buffer rejected the request.
    pub fn is_buffer_overflow(&self) -> bool {
        matches!(self, Self::BufferOverflow)
    }

    /// Check if the pipeline shut down underneath the request.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::PipelineShutdown)
    }

    /// The status code, when the server answered with one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { message } => write!(f, "network failure: {}", message),
            Self::HttpStatus { status, body } => {
                if body.is_empty() {
                    write!(f, "unexpected status {}", status)
                } else {
                    write!(f, "unexpected status {}: {}", status, body)
                }
            }
            Self::Timeout { elapsed, timeout } => {
                write!(f, "request timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::Parse(e) => write!(f, "{}", e),
            Self::BufferOverflow => write!(f, "ingress buffer rejected the request"),
            Self::UnexpectedEmpty => {
                write!(f, "empty 204 body where the request expected data")
            }
            Self::PipelineShutdown => write!(f, "pipeline shut down before the request completed"),
        }
    }
}

impl std::error::Error for ErrorCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

/// Failure to decode a response body into the caller's type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to decode response body: {message}")]
pub struct ParseError {
    message: String,
}

impl ParseError {
    /// Wrap a decoder's message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// The decoder's message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// Invalid pipeline or limiter configuration, reported by
/// [`Pipeline::new`](crate::Pipeline::new).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("buffer_size must be greater than zero")]
    ZeroBufferSize,
    #[error("parallelism must be greater than zero")]
    ZeroParallelism,
    #[error("bucket_capacity must be greater than zero")]
    ZeroBucketCapacity,
    #[error("http_timeout must be non-zero")]
    ZeroHttpTimeout,
    #[error("token contains characters that cannot appear in a header")]
    InvalidToken,
}
