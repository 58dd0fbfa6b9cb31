use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;

use crate::error::{Error, SharedError, TransportErrorKind};
use crate::util::{lock_unpoisoned, parse_header_name, parse_header_value};

#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{kind} error: {source}")]
    Io {
        kind: TransportErrorKind,
        #[source]
        source: SharedError,
    },
    #[error("response body too large ({actual_bytes} bytes > {limit_bytes} bytes)")]
    BodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
    },
}

/// The request-issuing seam. Responses come back fully buffered; bounded
/// reads are the transport's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn roundtrip(
        &self,
        request: Request<Bytes>,
    ) -> std::result::Result<Response<Bytes>, TransportError>;
}

type PooledClient = HyperClient<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Production transport: pooled hyper client over rustls (ring provider,
/// webpki roots), speaking http/1.1 and h2 to both cleartext and TLS origins.
pub struct HyperTransport {
    client: PooledClient,
    max_response_body_bytes: usize,
}

impl HyperTransport {
    pub fn new(
        pool_idle_timeout: Duration,
        pool_max_idle_per_host: usize,
        max_response_body_bytes: usize,
    ) -> crate::Result<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| Error::TransportInit {
                message: source.to_string(),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build(https);
        Ok(Self {
            client,
            max_response_body_bytes: max_response_body_bytes.max(1),
        })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn roundtrip(
        &self,
        request: Request<Bytes>,
    ) -> std::result::Result<Response<Bytes>, TransportError> {
        let (parts, body) = request.into_parts();
        let request = Request::from_parts(parts, Full::new(body));
        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| TransportError::Io {
                kind: classify_transport_error(&source),
                source: Arc::new(source),
            })?;
        let (parts, body) = response.into_parts();
        let body = read_all_body_limited(body, self.max_response_body_bytes).await?;
        Ok(Response::from_parts(parts, body))
    }
}

async fn read_all_body_limited(
    mut body: Incoming,
    limit_bytes: usize,
) -> std::result::Result<Bytes, TransportError> {
    let mut collected = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|source| TransportError::Io {
            kind: TransportErrorKind::Read,
            source: Arc::new(source),
        })?;
        if let Ok(data) = frame.into_data() {
            if collected.len() + data.len() > limit_bytes {
                return Err(TransportError::BodyTooLarge {
                    limit_bytes,
                    actual_bytes: collected.len() + data.len(),
                });
            }
            collected.extend_from_slice(&data);
        }
    }
    Ok(collected.freeze())
}

fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    let text = error.to_string().to_ascii_lowercase();
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

/// One scripted mock reply.
#[derive(Clone, Debug)]
pub struct MockResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    delay: Duration,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson {
            source: Arc::new(source),
        })?;
        self.body = Bytes::from(body);
        self.headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        Ok(self)
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Request observed by a [`MockTransport`], kept for assertions.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Scripted transport backing mock-only mode and tests: replies are served
/// in FIFO order, every observed request is recorded, and an exhausted queue
/// surfaces as a transport error rather than a panic.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<MockResponse>>,
    recorded: Mutex<Vec<RecordedRequest>>,
    calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: impl IntoIterator<Item = MockResponse>) -> Self {
        let transport = Self::new();
        for response in responses {
            transport.enqueue(response);
        }
        transport
    }

    pub fn enqueue(&self, response: MockResponse) {
        lock_unpoisoned(&self.responses).push_back(response);
    }

    /// Number of roundtrips served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock_unpoisoned(&self.recorded).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn roundtrip(
        &self,
        request: Request<Bytes>,
    ) -> std::result::Result<Response<Bytes>, TransportError> {
        let (parts, body) = request.into_parts();
        lock_unpoisoned(&self.recorded).push(RecordedRequest {
            method: parts.method,
            uri: parts.uri.to_string(),
            headers: parts.headers,
            body,
        });
        self.calls.fetch_add(1, Ordering::SeqCst);

        let scripted = lock_unpoisoned(&self.responses).pop_front();
        let Some(scripted) = scripted else {
            return Err(TransportError::Io {
                kind: TransportErrorKind::Other,
                source: Arc::new(std::io::Error::other("mock response queue is empty")),
            });
        };

        if !scripted.delay.is_zero() {
            tokio::time::sleep(scripted.delay).await;
        }

        let mut response = Response::new(scripted.body);
        *response.status_mut() = scripted.status;
        *response.headers_mut() = scripted.headers;
        Ok(response)
    }
}
