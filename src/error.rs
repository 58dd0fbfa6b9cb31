use std::sync::Arc;

use http::{HeaderMap, Method};

/// Clonable source type: deduplicated callers all receive the same failure,
/// so every variant must be cheap to clone.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// How a request came to be cancelled: an explicit abort through the caller's
/// cancellation token, or the configured timeout elapsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelKind {
    Abort,
    Timeout,
}

impl std::fmt::Display for CancelKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Abort => "abort",
            Self::Timeout => "timeout",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    SerializeJson,
    SerializeQuery,
    SerializeForm,
    RequestBuild,
    TransportInit,
    Transport,
    HttpStatus,
    Cancelled,
    ResponseBodyTooLarge,
    DecodeBody,
    DeserializeJson,
    InvalidHeaderName,
    InvalidHeaderValue,
    MockTransportMissing,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::SerializeForm => "serialize_form",
            Self::RequestBuild => "request_build",
            Self::TransportInit => "transport_init",
            Self::Transport => "transport",
            Self::HttpStatus => "http_status",
            Self::Cancelled => "cancelled",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::DecodeBody => "decode_body",
            Self::DeserializeJson => "deserialize_json",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::MockTransportMissing => "mock_transport_missing",
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("failed to serialize request query: {message}")]
    SerializeQuery { message: String },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: Arc<serde_urlencoded::ser::Error>,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: Arc<http::Error>,
    },
    #[error("failed to initialize http transport: {message}")]
    TransportInit { message: String },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        headers: Box<HeaderMap>,
        body: String,
    },
    #[error("request cancelled ({kind}) for {method} {uri}")]
    Cancelled {
        kind: CancelKind,
        timeout_ms: Option<u128>,
        method: Method,
        uri: String,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to decode response body as {expected} for {method} {uri}: {message}")]
    DecodeBody {
        expected: &'static str,
        message: String,
        method: Method,
        uri: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    DeserializeJson {
        #[source]
        source: Arc<serde_json::Error>,
        body: String,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderName>,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderValue>,
    },
    #[error("request requires a mock transport but none is registered: {method} {uri}")]
    MockTransportMissing { method: Method, uri: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::TransportInit { .. } => ErrorCode::TransportInit,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::DecodeBody { .. } => ErrorCode::DecodeBody,
            Self::DeserializeJson { .. } => ErrorCode::DeserializeJson,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::MockTransportMissing { .. } => ErrorCode::MockTransportMissing,
        }
    }

    /// HTTP status for status failures, `None` for everything else.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
