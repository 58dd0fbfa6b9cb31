use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::Result;
use crate::auth::AuthStrategy;
use crate::body::RequestBody;
use crate::config::{Override, RequestConfig, ResponseType};
use crate::dedupe::{InflightMap, fingerprint};
use crate::error::{CancelKind, Error};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::request::RequestBuilder;
use crate::response::Response;
use crate::retry::{JitteredBackoff, RetryContext, RetryStrategy};
use crate::transport::{HyperTransport, Transport, TransportError};
use crate::util::{
    merge_headers, parse_header_name, parse_header_value, redact_uri_for_logs, resolve_uri,
    truncate_body,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_CLIENT_NAME: &str = "fetchx";
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

pub struct ClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    max_response_body_bytes: usize,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    retry: Arc<dyn RetryStrategy>,
    auth: Option<Arc<dyn AuthStrategy>>,
    dedupe_requests: bool,
    client_name: String,
    transport: Option<Arc<dyn Transport>>,
    mock_transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            retry: Arc::new(JitteredBackoff::standard()),
            auth: None,
            dedupe_requests: false,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            transport: None,
            mock_transport: None,
        }
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn retry_strategy(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn auth_strategy(mut self, auth: Arc<dyn AuthStrategy>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Client-wide default for in-flight deduplication; individual requests
    /// override with [`RequestBuilder::dedupe`].
    pub fn dedupe_requests(mut self, dedupe_requests: bool) -> Self {
        self.dedupe_requests = dedupe_requests;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Replaces the default hyper transport for every request issued through
    /// this client.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registers the transport served to requests marked
    /// [`RequestBuilder::require_mock`].
    pub fn mock_transport(mut self, mock_transport: Arc<dyn Transport>) -> Self {
        self.mock_transport = Some(mock_transport);
        self
    }

    pub fn try_build(self) -> Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(
                self.pool_idle_timeout,
                self.pool_max_idle_per_host,
                self.max_response_body_bytes,
            )?),
        };

        Ok(Client {
            base_url: self.base_url,
            default_headers: self.default_headers,
            request_timeout: self.request_timeout,
            retry: self.retry,
            auth: self.auth,
            dedupe_requests: self.dedupe_requests,
            client_name: self.client_name,
            transport,
            mock_transport: self.mock_transport,
            inflight: InflightMap::new(),
            metrics: ClientMetrics::default(),
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build fetchx client: {error}"))
    }
}

/// Request-execution engine. Cloning is cheap and clones share the dedupe
/// map and metrics, so one logical client can be handed around freely.
#[derive(Clone)]
pub struct Client {
    base_url: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    retry: Arc<dyn RetryStrategy>,
    auth: Option<Arc<dyn AuthStrategy>>,
    dedupe_requests: bool,
    client_name: String,
    transport: Arc<dyn Transport>,
    mock_transport: Option<Arc<dyn Transport>>,
    inflight: InflightMap,
    metrics: ClientMetrics,
}

pub(crate) struct RequestParts {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: RequestBody,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) response_type: ResponseType,
    pub(crate) dedupe: Option<bool>,
    pub(crate) auth: Override<Arc<dyn AuthStrategy>>,
    pub(crate) retry: Override<Arc<dyn RetryStrategy>>,
    pub(crate) require_mock: bool,
}

struct PreparedRequest {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Bytes,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    response_type: ResponseType,
    auth: Option<Arc<dyn AuthStrategy>>,
    retry: Option<Arc<dyn RetryStrategy>>,
    transport: Arc<dyn Transport>,
}

enum AttemptOutcome {
    Done(Result<Response>),
    Replay,
    Retry,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn head(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, path)
    }

    pub fn options(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::OPTIONS, path)
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) async fn execute(&self, parts: RequestParts) -> Result<Response> {
        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();
        let started = Instant::now();
        let result = self.execute_inner(parts).await;
        self.metrics
            .record_request_completed(&result, started.elapsed());
        result
    }

    async fn execute_inner(&self, parts: RequestParts) -> Result<Response> {
        let (uri_text, _uri) = resolve_uri(&self.base_url, &parts.path)?;
        let transport = if parts.require_mock {
            // Programmer error, surfaced before any attempt runs.
            self.mock_transport
                .clone()
                .ok_or_else(|| Error::MockTransportMissing {
                    method: parts.method.clone(),
                    uri: redact_uri_for_logs(&uri_text),
                })?
        } else {
            Arc::clone(&self.transport)
        };

        let headers = merge_headers(&self.default_headers, &parts.headers);
        let body = parts.body.encode();
        let dedupe = parts.dedupe.unwrap_or(self.dedupe_requests);
        let prepared = PreparedRequest {
            method: parts.method,
            uri: uri_text,
            headers,
            body,
            timeout: Some(parts.timeout.unwrap_or(self.request_timeout)),
            cancel: parts.cancel,
            response_type: parts.response_type,
            auth: parts.auth.resolve(self.auth.as_ref()),
            retry: parts.retry.resolve(Some(&self.retry)),
            transport,
        };

        if !dedupe {
            return self.run_attempts(prepared).await;
        }

        let key = fingerprint(
            &prepared.method,
            &prepared.uri,
            &prepared.headers,
            &prepared.body,
        );
        let (shared, joined) = self.inflight.join_or_insert(&key, || {
            let client = self.clone();
            let cleanup_key = key.clone();
            async move {
                let result = client.run_attempts(prepared).await;
                // The shared future resolves exactly once, so this runs on
                // success, failure and cancellation alike.
                client.inflight.remove(&cleanup_key);
                result
            }
            .boxed()
        });
        if joined {
            self.metrics.record_dedupe_join();
            debug!(key = %key, "joined in-flight request");
        }
        shared.await
    }

    async fn run_attempts(&self, prepared: PreparedRequest) -> Result<Response> {
        let PreparedRequest {
            method,
            uri,
            headers: base_headers,
            body,
            timeout,
            cancel,
            response_type,
            auth,
            retry,
            transport,
        } = prepared;
        let redacted_uri = redact_uri_for_logs(&uri);
        let mut attempt: u32 = 1;
        let mut auth_replayed = false;

        loop {
            let span = info_span!(
                "fetchx.request",
                client = %self.client_name,
                method = %method,
                uri = %redacted_uri,
                attempt = attempt
            );
            let outcome = async {
                let mut headers = base_headers.clone();
                let mut config = RequestConfig {
                    method: method.clone(),
                    uri: uri.clone(),
                    headers: headers.clone(),
                    body: body.clone(),
                    timeout,
                    response_type,
                };
                if let Some(auth) = &auth {
                    match auth.enrich(&config).await {
                        Ok(enriched) => {
                            for (name, value) in enriched.iter() {
                                headers.insert(name.clone(), value.clone());
                            }
                            config.headers = headers.clone();
                        }
                        Err(error) => return AttemptOutcome::Done(Err(error)),
                    }
                }

                debug!("sending request");
                let request = match build_http_request(&method, &uri, &headers, body.clone()) {
                    Ok(request) => request,
                    Err(error) => return AttemptOutcome::Done(Err(error)),
                };
                let raw = match dispatch(
                    transport.as_ref(),
                    request,
                    timeout,
                    cancel.as_ref(),
                    &method,
                    &redacted_uri,
                )
                .await
                {
                    Ok(raw) => raw,
                    Err(error @ Error::Cancelled { .. }) => {
                        // Cancellation always wins: no decode, no auth hook,
                        // no retry evaluation.
                        return AttemptOutcome::Done(Err(error));
                    }
                    Err(error @ Error::ResponseBodyTooLarge { .. }) => {
                        return AttemptOutcome::Done(Err(error));
                    }
                    Err(error) => {
                        let transport_error_kind = match &error {
                            Error::Transport { kind, .. } => Some(*kind),
                            _ => None,
                        };
                        let ctx = RetryContext {
                            attempt,
                            method: &method,
                            uri: &redacted_uri,
                            status: None,
                            headers: None,
                            transport_error_kind,
                        };
                        let Some(retry) = &retry else {
                            return AttemptOutcome::Done(Err(error));
                        };
                        if !retry.should_retry(&ctx) {
                            return AttemptOutcome::Done(Err(error));
                        }
                        let delay = retry.next_delay(&ctx);
                        warn!(
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying request after transport error"
                        );
                        self.metrics.record_retry();
                        if let Err(cancelled) =
                            retry_sleep(delay, cancel.as_ref(), &method, &redacted_uri).await
                        {
                            return AttemptOutcome::Done(Err(cancelled));
                        }
                        return AttemptOutcome::Retry;
                    }
                };

                let status = raw.status();
                let (raw_parts, response_body) = raw.into_parts();
                let response_headers = raw_parts.headers;

                if status.is_success() {
                    debug!(status = status.as_u16(), "request completed");
                    return AttemptOutcome::Done(Response::decode(
                        status,
                        response_headers,
                        response_body,
                        response_type,
                        &method,
                        &redacted_uri,
                    ));
                }

                if let Some(auth) = &auth
                    && !auth_replayed
                {
                    let failure = Response::for_failure(
                        status,
                        response_headers.clone(),
                        response_body.clone(),
                    );
                    if auth.handle_error(&config, &failure).await {
                        debug!(
                            status = status.as_u16(),
                            "credentials refreshed; replaying request"
                        );
                        self.metrics.record_auth_replay();
                        return AttemptOutcome::Replay;
                    }
                }

                let error = Error::HttpStatus {
                    status: status.as_u16(),
                    method: method.clone(),
                    uri: redacted_uri.clone(),
                    headers: Box::new(response_headers.clone()),
                    body: truncate_body(&response_body),
                };
                let ctx = RetryContext {
                    attempt,
                    method: &method,
                    uri: &redacted_uri,
                    status: Some(status),
                    headers: Some(&response_headers),
                    transport_error_kind: None,
                };
                let Some(retry) = &retry else {
                    return AttemptOutcome::Done(Err(error));
                };
                if !retry.should_retry(&ctx) {
                    return AttemptOutcome::Done(Err(error));
                }
                let delay = retry.next_delay(&ctx);
                warn!(
                    status = status.as_u16(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying request after retryable status"
                );
                self.metrics.record_retry();
                if let Err(cancelled) =
                    retry_sleep(delay, cancel.as_ref(), &method, &redacted_uri).await
                {
                    return AttemptOutcome::Done(Err(cancelled));
                }
                AttemptOutcome::Retry
            }
            .instrument(span)
            .await;

            match outcome {
                AttemptOutcome::Done(result) => return result,
                // Token-refresh replay is not a retry: the attempt counter
                // stays put and the retry strategy is never consulted.
                AttemptOutcome::Replay => auth_replayed = true,
                AttemptOutcome::Retry => attempt += 1,
            }
        }
    }
}

/// Runs the transport call under the effective cancellation regime: the
/// caller's token when present, otherwise the configured timeout.
async fn dispatch(
    transport: &dyn Transport,
    request: Request<Bytes>,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
    method: &Method,
    uri: &str,
) -> Result<http::Response<Bytes>> {
    let roundtrip = transport.roundtrip(request);
    let outcome = match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(Error::Cancelled {
                        kind: CancelKind::Abort,
                        timeout_ms: None,
                        method: method.clone(),
                        uri: uri.to_owned(),
                    });
                }
                outcome = roundtrip => outcome,
            }
        }
        None => match timeout {
            Some(limit) => match tokio::time::timeout(limit, roundtrip).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(Error::Cancelled {
                        kind: CancelKind::Timeout,
                        timeout_ms: Some(limit.as_millis()),
                        method: method.clone(),
                        uri: uri.to_owned(),
                    });
                }
            },
            None => roundtrip.await,
        },
    };

    outcome.map_err(|error| match error {
        TransportError::Io { kind, source } => Error::Transport {
            kind,
            method: method.clone(),
            uri: uri.to_owned(),
            source,
        },
        TransportError::BodyTooLarge {
            limit_bytes,
            actual_bytes,
        } => Error::ResponseBodyTooLarge {
            limit_bytes,
            actual_bytes,
            method: method.clone(),
            uri: uri.to_owned(),
        },
    })
}

/// Backoff wait between attempts, interruptible by the caller's token.
async fn retry_sleep(
    delay: Duration,
    cancel: Option<&CancellationToken>,
    method: &Method,
    uri: &str,
) -> Result<()> {
    if delay.is_zero() {
        return Ok(());
    }
    match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled {
                    kind: CancelKind::Abort,
                    timeout_ms: None,
                    method: method.clone(),
                    uri: uri.to_owned(),
                }),
                _ = sleep(delay) => Ok(()),
            }
        }
        None => {
            sleep(delay).await;
            Ok(())
        }
    }
}

fn build_http_request(
    method: &Method,
    uri: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Request<Bytes>> {
    let mut request = Request::builder()
        .method(method.clone())
        .uri(uri)
        .body(body)
        .map_err(|source| Error::RequestBuild {
            source: Arc::new(source),
        })?;
    *request.headers_mut() = headers.clone();
    Ok(request)
}
