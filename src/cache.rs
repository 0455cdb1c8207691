//! Contract between cache entries and the blocking-query cache framework.
//!
//! The framework stores entry values and per-entry state opaquely; an
//! entry downcasts them back on the next call. Requests are keyed by
//! [`RequestInfo`] so the framework can multiplex long polls per
//! (token, datacenter, key) triple.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Opaque entry value as held by the cache framework.
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Opaque per-entry metadata round-tripped through the framework so
/// successive fetches of the same entry form a coherent state machine.
pub type EntryState = Arc<dyn Any + Send + Sync>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a single fetch. `index` drives blocking-query comparisons.
#[derive(Clone, Default)]
pub struct FetchResult {
    pub value: Option<CacheValue>,
    pub state: Option<EntryState>,
    pub index: u64,
}

impl std::fmt::Debug for FetchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResult")
            .field("value", &self.value.as_ref().map(|_| ".."))
            .field("state", &self.state.as_ref().map(|_| ".."))
            .field("index", &self.index)
            .finish()
    }
}

/// Per-call inputs handed to an entry by the framework.
#[derive(Clone)]
pub struct FetchOptions {
    /// Soft bound on how long the fetch may block before returning the
    /// current value unchanged. Measured from the start of the call.
    pub timeout: Duration,
    /// The result of the previous fetch of this entry, if any.
    pub last_result: Option<FetchResult>,
}

/// Blocking-query keying data for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub key: String,
    pub token: String,
    pub datacenter: String,
    pub min_index: u64,
}

pub trait CacheRequest: Send + Sync {
    fn cache_info(&self) -> RequestInfo;

    /// Entry implementations downcast the request to their own type.
    fn as_any(&self) -> &dyn Any;
}

/// A registered cache entry type.
///
/// On `Err` the framework keeps the previously cached value and state
/// unchanged and applies its own backoff before the caller's next poll;
/// entries never retry internally.
#[async_trait]
pub trait CacheEntry: Send + Sync {
    async fn fetch(
        &self,
        opts: FetchOptions,
        req: &dyn CacheRequest,
    ) -> Result<FetchResult, BoxError>;

    /// Whether the framework should wire long-poll semantics for this type.
    fn supports_blocking(&self) -> bool {
        false
    }
}
