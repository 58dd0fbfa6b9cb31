//! `fetchx` is a declarative HTTP request-execution engine for API SDKs:
//! requests are described through a fluent builder, and the engine resolves
//! authentication, retries failures with jittered backoff, deduplicates
//! concurrent identical requests, and decodes the response. Every request is
//! cancellable and timeout-bounded.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use fetchx::prelude::{Client, JitteredBackoff};
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Deserialize)]
//! struct User {
//!     id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://api.example.com")
//!         .client_name("my-sdk")
//!         .request_timeout(Duration::from_secs(3))
//!         .retry_strategy(Arc::new(
//!             JitteredBackoff::standard()
//!                 .max_attempts(3)
//!                 .base_delay(Duration::from_millis(100))
//!                 .max_delay(Duration::from_millis(800)),
//!         ))
//!         .dedupe_requests(true)
//!         .try_build()?;
//!
//!     let user: User = client
//!         .get("/v1/users/1")
//!         .query(&serde_json::json!({ "expand": "profile" }))?
//!         .send_json()
//!         .await?;
//!
//!     println!("user id={}", user.id);
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Keep `JitteredBackoff::standard()` for SDK traffic; it honors
//!   `Retry-After` and never retries cancellations or 4xx statuses.
//! - Enable `dedupe_requests(true)` for read-mostly clients so concurrent
//!   identical GETs coalesce onto one network call.
//! - Give refreshable credentials a `RefreshingTokenAuth` backed by a
//!   `PersistStorage` that outlives the process when sessions should survive
//!   restarts.

mod auth;
mod body;
mod client;
mod config;
mod dedupe;
mod error;
mod metrics;
mod request;
mod response;
mod retry;
mod storage;
mod transport;
mod util;

pub use crate::auth::{
    ApiKeyAuth, AuthStrategy, BearerAuth, NoAuth, RefreshingTokenAuth, TokenPair,
};
pub use crate::body::RequestBody;
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{Override, RequestConfig, ResponseType};
pub use crate::error::{CancelKind, Error, ErrorCode, SharedError, TransportErrorKind};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::request::RequestBuilder;
pub use crate::response::{Payload, Response};
pub use crate::retry::{
    ExponentialBackoff, FixedDelay, JitteredBackoff, NoRetry, RetryContext, RetryStrategy,
};
pub use crate::storage::{FileStorage, MemoryStorage, PersistStorage};
pub use crate::transport::{
    HyperTransport, MockResponse, MockTransport, RecordedRequest, Transport, TransportError,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AuthStrategy, CancelKind, Client, Error, ErrorCode, JitteredBackoff, Payload,
        RefreshingTokenAuth, Response, ResponseType, RetryStrategy, TokenPair, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
