use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;
use crate::config::RequestConfig;
use crate::response::Response;
use crate::storage::PersistStorage;
use crate::transport::Transport;
use crate::util::{lock_unpoisoned, parse_header_name, parse_header_value};

const DEFAULT_TOKEN_STORAGE_KEY: &str = "fetchx.token_pair";

/// Pluggable policy that enriches outgoing requests with credentials and
/// optionally reacts to auth failures by refreshing them.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Headers to merge into the outgoing request. Must be idempotent:
    /// called once per attempt, including replays after a prior failure.
    async fn enrich(&self, config: &RequestConfig) -> Result<HeaderMap>;

    /// Invoked with the failure response before ordinary retry handling.
    /// Returning `true` means credentials were refreshed and the request
    /// should be replayed without consuming a retry attempt.
    async fn handle_error(&self, _config: &RequestConfig, _response: &Response) -> bool {
        false
    }
}

/// Explicit no-credentials strategy; equivalent to configuring none at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuth;

#[async_trait]
impl AuthStrategy for NoAuth {
    async fn enrich(&self, _config: &RequestConfig) -> Result<HeaderMap> {
        Ok(HeaderMap::new())
    }
}

/// Static API key sent in a configurable header.
#[derive(Clone, Debug)]
pub struct ApiKeyAuth {
    header: HeaderName,
    value: HeaderValue,
}

impl ApiKeyAuth {
    pub fn new(header: &str, key: &str) -> Result<Self> {
        let header = parse_header_name(header)?;
        let mut value = parse_header_value(header.as_str(), key)?;
        value.set_sensitive(true);
        Ok(Self { header, value })
    }
}

#[async_trait]
impl AuthStrategy for ApiKeyAuth {
    async fn enrich(&self, _config: &RequestConfig) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(self.header.clone(), self.value.clone());
        Ok(headers)
    }
}

/// Static bearer token in the `Authorization` header.
#[derive(Clone, Debug)]
pub struct BearerAuth {
    value: HeaderValue,
}

impl BearerAuth {
    pub fn new(token: &str) -> Result<Self> {
        Ok(Self {
            value: bearer_value(token)?,
        })
    }
}

#[async_trait]
impl AuthStrategy for BearerAuth {
    async fn enrich(&self, _config: &RequestConfig) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.value.clone());
        Ok(headers)
    }
}

fn bearer_value(token: &str) -> Result<HeaderValue> {
    let mut value = parse_header_value("authorization", &format!("Bearer {token}"))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Access/refresh token pair persisted across process lifetimes. Written
/// whole on every rotation, never field by field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

/// Wire shape of the refresh endpoint reply.
#[derive(Debug, Deserialize)]
struct RefreshReply {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// Bearer auth backed by a persisted token pair with refresh-and-replay.
///
/// Holds no token in memory: every enrich call reads the stored pair, so a
/// rotation performed by any other holder of the same storage is picked up
/// on the next attempt. On 401/403 the stored refresh token is posted to the
/// refresh endpoint; concurrent failures coalesce on one in-flight refresh.
pub struct RefreshingTokenAuth {
    storage: Arc<dyn PersistStorage>,
    transport: Arc<dyn Transport>,
    refresh_url: String,
    storage_key: String,
    refresh_in_flight: Arc<Mutex<Option<Shared<BoxFuture<'static, bool>>>>>,
}

impl RefreshingTokenAuth {
    /// `refresh_url` must be absolute; the strategy talks straight to the
    /// transport and performs no base-URL resolution.
    pub fn new(
        storage: Arc<dyn PersistStorage>,
        transport: Arc<dyn Transport>,
        refresh_url: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            transport,
            refresh_url: refresh_url.into(),
            storage_key: DEFAULT_TOKEN_STORAGE_KEY.to_owned(),
            refresh_in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    fn join_or_start_refresh(&self) -> Shared<BoxFuture<'static, bool>> {
        // Check-and-insert stays synchronous under the lock so two failures
        // landing in the same poll cannot both start a refresh.
        let mut slot = lock_unpoisoned(&self.refresh_in_flight);
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }

        let storage = Arc::clone(&self.storage);
        let transport = Arc::clone(&self.transport);
        let refresh_url = self.refresh_url.clone();
        let storage_key = self.storage_key.clone();
        let slot_handle = Arc::clone(&self.refresh_in_flight);
        let refresh = async move {
            let refreshed = refresh_once(storage, transport, refresh_url, storage_key).await;
            *lock_unpoisoned(&slot_handle) = None;
            refreshed
        }
        .boxed()
        .shared();
        *slot = Some(refresh.clone());
        refresh
    }
}

#[async_trait]
impl AuthStrategy for RefreshingTokenAuth {
    async fn enrich(&self, _config: &RequestConfig) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let pair = self
            .storage
            .get_value::<TokenPair>(&self.storage_key)
            .await;
        if let Some(pair) = pair {
            headers.insert(AUTHORIZATION, bearer_value(&pair.access)?);
        }
        Ok(headers)
    }

    async fn handle_error(&self, _config: &RequestConfig, response: &Response) -> bool {
        let status = response.status();
        if status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN {
            return false;
        }
        self.join_or_start_refresh().await
    }
}

async fn refresh_once(
    storage: Arc<dyn PersistStorage>,
    transport: Arc<dyn Transport>,
    refresh_url: String,
    storage_key: String,
) -> bool {
    let Some(pair) = storage.get_value::<TokenPair>(&storage_key).await else {
        debug!("no token pair stored; cannot refresh");
        return false;
    };
    let Some(refresh_token) = pair.refresh.clone() else {
        debug!("stored token pair has no refresh token");
        return false;
    };

    let Ok(body) = serde_json::to_vec(&serde_json::json!({ "token": refresh_token })) else {
        return false;
    };
    let request = Request::builder()
        .method(Method::POST)
        .uri(&refresh_url)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Bytes::from(body));
    let Ok(request) = request else {
        warn!(refresh_url = %refresh_url, "failed to build token refresh request");
        return false;
    };

    let response = match transport.roundtrip(request).await {
        Ok(response) => response,
        Err(error) => {
            warn!(error = %error, "token refresh request failed");
            return false;
        }
    };
    if !response.status().is_success() {
        warn!(status = response.status().as_u16(), "token refresh rejected");
        return false;
    }

    let reply: RefreshReply = match serde_json::from_slice(response.body()) {
        Ok(reply) => reply,
        Err(error) => {
            warn!(error = %error, "token refresh reply did not parse");
            return false;
        }
    };

    let rotated = TokenPair {
        access: reply.access,
        // Endpoints that do not rotate the refresh token omit it; keep the
        // old one so later refreshes still work.
        refresh: reply.refresh.or(pair.refresh),
    };
    if let Err(error) = storage.set_value(&storage_key, &rotated).await {
        warn!(error = %error, "failed to persist rotated token pair");
        return false;
    }
    debug!("access token refreshed");
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};

    use super::{AuthStrategy, BearerAuth, RefreshingTokenAuth, TokenPair};
    use crate::config::{RequestConfig, ResponseType};
    use crate::response::Response;
    use crate::storage::{MemoryStorage, PersistStorage};
    use crate::transport::{MockResponse, MockTransport};

    fn config() -> RequestConfig {
        RequestConfig {
            method: Method::GET,
            uri: "https://api.example.com/v1/items".to_owned(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
            response_type: ResponseType::Auto,
        }
    }

    fn failure(status: StatusCode) -> Response {
        Response::for_failure(status, HeaderMap::new(), Bytes::new())
    }

    async fn seeded_storage(pair: &TokenPair) -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        (storage.clone() as Arc<dyn PersistStorage>)
            .set_value("fetchx.token_pair", pair)
            .await
            .expect("seed token pair");
        storage
    }

    #[tokio::test]
    async fn enrich_is_idempotent() {
        let storage = seeded_storage(&TokenPair {
            access: "abc".to_owned(),
            refresh: None,
        })
        .await;
        let auth = RefreshingTokenAuth::new(
            storage,
            Arc::new(MockTransport::new()),
            "https://id.example.com/refresh",
        );

        let first = auth.enrich(&config()).await.expect("first enrich");
        let second = auth.enrich(&config()).await.expect("second enrich");
        assert_eq!(first.get("authorization"), second.get("authorization"));
        assert!(first.contains_key("authorization"));
    }

    #[tokio::test]
    async fn bearer_auth_sets_authorization() {
        let auth = BearerAuth::new("token-1").expect("bearer auth");
        let headers = auth.enrich(&config()).await.expect("enrich");
        let value = headers.get("authorization").expect("authorization header");
        assert_eq!(value.to_str().expect("ascii"), "Bearer token-1");
    }

    #[tokio::test]
    async fn handle_error_ignores_non_auth_statuses() {
        let storage = seeded_storage(&TokenPair {
            access: "abc".to_owned(),
            refresh: Some("r1".to_owned()),
        })
        .await;
        let auth = RefreshingTokenAuth::new(
            storage,
            Arc::new(MockTransport::new()),
            "https://id.example.com/refresh",
        );

        assert!(
            !auth
                .handle_error(&config(), &failure(StatusCode::INTERNAL_SERVER_ERROR))
                .await
        );
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_reports_unhandled() {
        let storage = seeded_storage(&TokenPair {
            access: "abc".to_owned(),
            refresh: None,
        })
        .await;
        let refresh_transport = Arc::new(MockTransport::new());
        let auth = RefreshingTokenAuth::new(
            storage,
            refresh_transport.clone(),
            "https://id.example.com/refresh",
        );

        assert!(
            !auth
                .handle_error(&config(), &failure(StatusCode::UNAUTHORIZED))
                .await
        );
        assert_eq!(refresh_transport.calls(), 0);
    }

    #[tokio::test]
    async fn successful_refresh_rotates_the_stored_pair() {
        let storage = seeded_storage(&TokenPair {
            access: "old".to_owned(),
            refresh: Some("r1".to_owned()),
        })
        .await;
        let refresh_transport = Arc::new(MockTransport::with_responses([MockResponse::new(200)
            .json(&serde_json::json!({ "access": "new", "refresh": "r2" }))
            .expect("mock json")]));
        let auth = RefreshingTokenAuth::new(
            storage.clone(),
            refresh_transport.clone(),
            "https://id.example.com/refresh",
        );

        assert!(
            auth.handle_error(&config(), &failure(StatusCode::UNAUTHORIZED))
                .await
        );
        assert_eq!(refresh_transport.calls(), 1);

        let rotated = (storage as Arc<dyn PersistStorage>)
            .get_value::<TokenPair>("fetchx.token_pair")
            .await
            .expect("rotated pair");
        assert_eq!(rotated.access, "new");
        assert_eq!(rotated.refresh.as_deref(), Some("r2"));

        let sent = refresh_transport.requests();
        assert_eq!(sent.len(), 1);
        let posted: serde_json::Value =
            serde_json::from_slice(&sent[0].body).expect("refresh request body");
        assert_eq!(posted, serde_json::json!({ "token": "r1" }));
    }

    #[tokio::test]
    async fn refresh_reply_without_rotation_keeps_old_refresh_token() {
        let storage = seeded_storage(&TokenPair {
            access: "old".to_owned(),
            refresh: Some("r1".to_owned()),
        })
        .await;
        let refresh_transport = Arc::new(MockTransport::with_responses([MockResponse::new(200)
            .json(&serde_json::json!({ "access": "new" }))
            .expect("mock json")]));
        let auth = RefreshingTokenAuth::new(
            storage.clone(),
            refresh_transport,
            "https://id.example.com/refresh",
        );

        assert!(
            auth.handle_error(&config(), &failure(StatusCode::FORBIDDEN))
                .await
        );
        let rotated = (storage as Arc<dyn PersistStorage>)
            .get_value::<TokenPair>("fetchx.token_pair")
            .await
            .expect("rotated pair");
        assert_eq!(rotated.access, "new");
        assert_eq!(rotated.refresh.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn concurrent_auth_failures_share_one_refresh() {
        let storage = seeded_storage(&TokenPair {
            access: "old".to_owned(),
            refresh: Some("r1".to_owned()),
        })
        .await;
        let refresh_transport = Arc::new(MockTransport::with_responses([MockResponse::new(200)
            .json(&serde_json::json!({ "access": "new" }))
            .expect("mock json")
            .delay(Duration::from_millis(40))]));
        let auth = Arc::new(RefreshingTokenAuth::new(
            storage,
            refresh_transport.clone(),
            "https://id.example.com/refresh",
        ));

        let cfg1 = config();
        let cfg2 = config();
        let fail1 = failure(StatusCode::UNAUTHORIZED);
        let fail2 = failure(StatusCode::UNAUTHORIZED);
        let (first, second) = tokio::join!(
            auth.handle_error(&cfg1, &fail1),
            auth.handle_error(&cfg2, &fail2),
        );
        assert!(first);
        assert!(second);
        assert_eq!(refresh_transport.calls(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_reports_unhandled() {
        let storage = seeded_storage(&TokenPair {
            access: "old".to_owned(),
            refresh: Some("r1".to_owned()),
        })
        .await;
        let refresh_transport = Arc::new(MockTransport::with_responses([MockResponse::new(500)]));
        let auth = RefreshingTokenAuth::new(
            storage,
            refresh_transport.clone(),
            "https://id.example.com/refresh",
        );

        assert!(
            !auth
                .handle_error(&config(), &failure(StatusCode::UNAUTHORIZED))
                .await
        );
        assert_eq!(refresh_transport.calls(), 1);
    }
}
