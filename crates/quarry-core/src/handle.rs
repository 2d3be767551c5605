//! Handles returned to callers of `initiate_query` and `initiate_mutation`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::endpoint::AbortController;
use crate::engine::Engine;
use crate::error::{EngineError, QueryError};
use crate::key::CacheKey;
use crate::subscription::SubscriptionId;
use crate::types::{MutationCacheEntry, QueryCacheEntry, QueryOutcome, Refetch, RequestId};

/// How a query handle obtains its result.
pub(crate) enum Dispatch {
    /// Served from cache (or nothing to serve).
    Ready(QueryOutcome),
    /// Issued or joined a transport call.
    InFlight {
        request_id: RequestId,
        controller: AbortController,
        result: watch::Receiver<Option<QueryOutcome>>,
    },
}

/// Wait for a request's outcome. Each receiver resolves independently.
pub(crate) async fn await_outcome(mut rx: watch::Receiver<Option<QueryOutcome>>) -> QueryOutcome {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Err(QueryError::Uninitialized)),
        // The request task went away without settling.
        Err(_) => Err(QueryError::Aborted),
    }
}

/// A consumer's view of one query request.
///
/// Dropping the handle does not unsubscribe; call [`QueryHandle::unsubscribe`].
pub struct QueryHandle {
    engine: Engine,
    cache_key: CacheKey,
    endpoint: String,
    args: Value,
    subscription: Option<SubscriptionId>,
    dispatch: Dispatch,
}

impl QueryHandle {
    pub(crate) fn new(
        engine: Engine,
        cache_key: CacheKey,
        endpoint: &str,
        args: Value,
        subscription: Option<SubscriptionId>,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            engine,
            cache_key,
            endpoint: endpoint.to_string(),
            args,
            subscription,
            dispatch,
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    /// The request this handle issued or joined; `None` when served from cache.
    pub fn request_id(&self) -> Option<RequestId> {
        match &self.dispatch {
            Dispatch::Ready(_) => None,
            Dispatch::InFlight { request_id, .. } => Some(*request_id),
        }
    }

    /// Await the outcome. Safe to call repeatedly and from several handles.
    pub async fn result(&self) -> QueryOutcome {
        match &self.dispatch {
            Dispatch::Ready(outcome) => outcome.clone(),
            Dispatch::InFlight { result, .. } => await_outcome(result.clone()).await,
        }
    }

    /// Abort the underlying request, which is shared with every joiner.
    pub fn abort(&self) {
        if let Dispatch::InFlight { controller, .. } = &self.dispatch {
            controller.abort();
        }
    }

    /// Force a new request for the same arguments.
    pub async fn refetch(&self) -> Result<QueryHandle, EngineError> {
        self.engine
            .fetch_query(&self.endpoint, &self.args, Some(Refetch::Always))
            .await
    }

    /// Withdraw this consumer. Returns false if it was not subscribed.
    pub async fn unsubscribe(&mut self) -> bool {
        match self.subscription.take() {
            Some(id) => self.engine.unsubscribe(id).await,
            None => false,
        }
    }

    /// Current cache entry for this key.
    pub async fn state(&self) -> Option<QueryCacheEntry> {
        self.engine.query_entry(&self.cache_key).await
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("cache_key", &self.cache_key)
            .field("subscription", &self.subscription)
            .field("request_id", &self.request_id())
            .finish_non_exhaustive()
    }
}

/// Options for a single mutation invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MutationOptions {
    /// Record the invocation in the cache state.
    pub track: bool,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self { track: true }
    }
}

/// A caller's view of one mutation invocation.
pub struct MutationHandle {
    pub(crate) engine: Engine,
    pub(crate) request_id: RequestId,
    pub(crate) controller: AbortController,
    pub(crate) result: watch::Receiver<Option<QueryOutcome>>,
}

impl MutationHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn result(&self) -> QueryOutcome {
        await_outcome(self.result.clone()).await
    }

    pub fn abort(&self) {
        self.controller.abort();
    }

    /// Remove the mutation's cache entry.
    pub async fn unsubscribe(self) -> bool {
        self.engine.remove_mutation(self.request_id).await
    }

    pub async fn state(&self) -> Option<MutationCacheEntry> {
        self.engine.mutation_state(self.request_id).await
    }
}

impl std::fmt::Debug for MutationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationHandle")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}
