use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use http::{HeaderMap, Method};

use crate::Result;
use crate::response::Response;
use crate::util::lock_unpoisoned;

pub(crate) type SharedResponseFuture = Shared<BoxFuture<'static, Result<Response>>>;

/// In-flight request map keyed by fingerprint. Shared by all clones of one
/// client; independent clients never interfere.
#[derive(Clone, Default)]
pub(crate) struct InflightMap {
    entries: Arc<Mutex<HashMap<String, SharedResponseFuture>>>,
}

impl InflightMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the existing shared future for `key`, or builds and registers
    /// a new one. The check and the insert happen under one lock with no
    /// suspension in between, so callers arriving in the same poll join
    /// instead of racing a second network call.
    pub(crate) fn join_or_insert<F>(&self, key: &str, make: F) -> (SharedResponseFuture, bool)
    where
        F: FnOnce() -> BoxFuture<'static, Result<Response>>,
    {
        let mut entries = lock_unpoisoned(&self.entries);
        if let Some(existing) = entries.get(key) {
            return (existing.clone(), true);
        }
        let shared = make().shared();
        entries.insert(key.to_owned(), shared.clone());
        (shared, false)
    }

    pub(crate) fn remove(&self, key: &str) {
        lock_unpoisoned(&self.entries).remove(key);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }
}

/// Deterministic dedupe key: method and resolved URL stay readable for
/// debugging, headers and body fold into a digest.
pub(crate) fn fingerprint(
    method: &Method,
    uri_text: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> String {
    let mut hasher = DefaultHasher::new();
    let mut names: Vec<&str> = headers.keys().map(|name| name.as_str()).collect();
    names.sort_unstable();
    for name in names {
        name.hash(&mut hasher);
        for value in headers.get_all(name) {
            value.as_bytes().hash(&mut hasher);
        }
    }
    body.hash(&mut hasher);
    format!("{method} {uri_text} {:016x}", hasher.finish())
}
