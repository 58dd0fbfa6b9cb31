use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::auth::AuthStrategy;
use crate::body::{RequestBody, multipart_boundary};
use crate::client::{Client, RequestParts};
use crate::config::{Override, ResponseType};
use crate::error::Error;
use crate::response::{Payload, Response, reparse_double_encoded};
use crate::retry::RetryStrategy;
use crate::util::{
    append_query_pairs, flatten_object_pairs, parse_header_name, parse_header_value,
};

/// Declarative request description. Every configuration method is pure
/// accumulation (no I/O) and chainable; the terminal methods hand the
/// accumulated description to the client's execution engine.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    response_type: ResponseType,
    dedupe: Option<bool>,
    auth: Override<Arc<dyn AuthStrategy>>,
    retry: Override<Arc<dyn RetryStrategy>>,
    require_mock: bool,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, path: String) -> Self {
        Self {
            client,
            method,
            path,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: None,
            cancel: None,
            response_type: ResponseType::Auto,
            dedupe: None,
            auth: Override::Inherit,
            retry: Override::Inherit,
            require_mock: false,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Merges the given headers into the accumulated set; existing names are
    /// replaced, unrelated names are kept.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in &headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    /// Serializes `params` into query pairs: arrays repeat the key, nested
    /// objects become JSON strings, null entries are dropped.
    pub fn query<T>(mut self, params: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(params).map_err(|source| Error::SerializeQuery {
            message: source.to_string(),
        })?;
        self.query_pairs.extend(flatten_object_pairs(&value)?);
        Ok(self)
    }

    /// JSON request body; forces `Content-Type: application/json`.
    pub fn json<T>(mut self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson {
            source: Arc::new(source),
        })?;
        self.body = RequestBody::Json(Bytes::from(body));
        Ok(self.header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn text(mut self, payload: impl Into<String>) -> Self {
        self.body = RequestBody::Text(payload.into());
        self.header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
    }

    pub fn bytes(mut self, payload: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Binary(payload.into());
        self.header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        )
    }

    /// Opaque payload sent as-is with no implied content type.
    pub fn raw(mut self, payload: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Raw(payload.into());
        self
    }

    /// URL-encoded form body; null entries are skipped.
    pub fn form<T>(mut self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(|source| Error::SerializeQuery {
            message: source.to_string(),
        })?;
        let pairs = flatten_object_pairs(&value)?;
        let encoded = serde_urlencoded::to_string(&pairs).map_err(|source| {
            Error::SerializeForm {
                source: Arc::new(source),
            }
        })?;
        self.body = RequestBody::Form(encoded);
        Ok(self.header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    /// Multipart form body; null entries are skipped.
    pub fn multipart<T>(mut self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(|source| Error::SerializeQuery {
            message: source.to_string(),
        })?;
        let fields = flatten_object_pairs(&value)?;
        let boundary = multipart_boundary();
        let content_type = parse_header_value(
            "content-type",
            &format!("multipart/form-data; boundary={boundary}"),
        )?;
        self.body = RequestBody::Multipart { boundary, fields };
        Ok(self.header(CONTENT_TYPE, content_type))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Binds the request to a caller-owned cancellation token. When present
    /// it becomes the effective abort signal and the timeout is not
    /// separately enforced.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Per-request auth override. Without this call the client default
    /// applies; see [`no_auth`](Self::no_auth) for explicit opt-out.
    pub fn auth(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.auth = Override::Value(strategy);
        self
    }

    /// Disables authentication for this request even when the client carries
    /// a default strategy.
    pub fn no_auth(mut self) -> Self {
        self.auth = Override::Disabled;
        self
    }

    pub fn retry(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry = Override::Value(strategy);
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry = Override::Disabled;
        self
    }

    /// Opts this request in or out of in-flight deduplication, overriding
    /// the client default.
    pub fn dedupe(mut self, enable: bool) -> Self {
        self.dedupe = Some(enable);
        self
    }

    /// Demands the registered mock transport; fails with a configuration
    /// error when none is registered. For test and offline builds.
    pub fn require_mock(mut self) -> Self {
        self.require_mock = true;
        self
    }

    fn into_parts(self) -> RequestParts {
        let path = append_query_pairs(&self.path, &self.query_pairs);
        RequestParts {
            method: self.method,
            path,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout,
            cancel: self.cancel,
            response_type: self.response_type,
            dedupe: self.dedupe,
            auth: self.auth,
            retry: self.retry,
            require_mock: self.require_mock,
        }
    }

    /// Executes the request and returns the full response.
    pub async fn send(self) -> Result<Response> {
        let client = self.client;
        client.execute(self.into_parts()).await
    }

    /// Executes the request and returns only the decoded payload. A payload
    /// that is itself a JSON-shaped string gets a secondary parse, falling
    /// back silently to the raw string.
    pub async fn data(self) -> Result<Payload> {
        let response = self.send().await?;
        Ok(reparse_double_encoded(response.into_data()))
    }

    pub async fn send_json<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send().await?;
        response.json()
    }
}
