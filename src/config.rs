use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};

/// How a response body should be decoded. `Auto` sniffs the content type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseType {
    #[default]
    Auto,
    Json,
    Text,
    Binary,
}

/// Tri-state per-request override for a client-level default.
///
/// `Inherit` means the request never touched the field, `Disabled` means the
/// caller explicitly turned the behavior off for this request, and `Value`
/// carries an explicit replacement. Builder methods must preserve the
/// distinction; collapsing `Disabled` into `Inherit` silently re-enables the
/// client default.
#[derive(Clone, Debug, Default)]
pub enum Override<T> {
    #[default]
    Inherit,
    Disabled,
    Value(T),
}

impl<T: Clone> Override<T> {
    pub(crate) fn resolve(&self, inherited: Option<&T>) -> Option<T> {
        match self {
            Self::Inherit => inherited.cloned(),
            Self::Disabled => None,
            Self::Value(value) => Some(value.clone()),
        }
    }
}

/// Wire-level request description handed to strategies and the transport.
///
/// Built fresh for every attempt; auth enrichment merges headers between
/// attempts but the rest never changes within one logical request.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Option<Duration>,
    pub response_type: ResponseType,
}
