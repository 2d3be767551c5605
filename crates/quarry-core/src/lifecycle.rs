//! Request lifecycle transitions.
//!
//! `uninitialized -> pending -> fulfilled | rejected`, and back to `pending`
//! on refetch. Only the request that currently owns an entry may settle it;
//! anything else is a stale response and is dropped.

use serde_json::Value;
use tracing::{debug, trace};

use crate::endpoint::AbortController;
use crate::error::{PatchError, QueryError};
use crate::key::CacheKey;
use crate::patch::{self, Patch};
use crate::store::{CacheEvent, InFlight, Transaction};
use crate::tags::Tag;
use crate::types::{Environment, MutationCacheEntry, QueryCacheEntry, QueryOutcome, QueryStatus, RequestId};

/// Result of trying to start a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartOutcome {
    Started,
    /// Another request owns the key.
    AlreadyPending(RequestId),
}

/// Result of trying to settle a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Commit {
    /// The entry was updated. `invalidated` is set when its tags were
    /// invalidated while the request was running.
    Applied { invalidated: bool },
    /// The entry was removed or taken over by a newer request.
    Stale,
}

impl Transaction<'_> {
    /// Move a key to `pending` under `request_id`. Existing data and error
    /// are kept.
    pub(crate) fn start_query(
        &mut self,
        key: &CacheKey,
        endpoint: &str,
        args: &Value,
        request_id: RequestId,
        controller: AbortController,
        result: tokio::sync::watch::Receiver<Option<QueryOutcome>>,
    ) -> StartOutcome {
        let now = self.now();
        let entry = self
            .inner
            .state
            .queries
            .entry(key.clone())
            .or_insert_with(|| QueryCacheEntry {
                endpoint_name: endpoint.to_string(),
                status: QueryStatus::Uninitialized,
                original_args: args.clone(),
                data: None,
                error: None,
                request_id: None,
                started_at: None,
                fulfilled_at: None,
                provided_tags: Vec::new(),
                invalidated: false,
            });

        if entry.status == QueryStatus::Pending {
            if let Some(current) = entry.request_id {
                return StartOutcome::AlreadyPending(current);
            }
        }

        entry.status = QueryStatus::Pending;
        entry.request_id = Some(request_id);
        entry.started_at = Some(now);
        entry.original_args = args.clone();

        self.inner.queries_in_flight.insert(
            key.clone(),
            InFlight {
                request_id,
                controller,
                result,
                refetch_after: false,
            },
        );
        debug!(key = %key, request_id = %request_id, "query started");
        self.emit(CacheEvent::QueryPending {
            key: key.clone(),
            request_id,
        });
        StartOutcome::Started
    }

    /// Take the in-flight record if `request_id` still owns the key.
    fn settle(&mut self, key: &CacheKey, request_id: RequestId) -> Option<(&mut QueryCacheEntry, bool)> {
        let owns = self
            .inner
            .state
            .queries
            .get(key)
            .is_some_and(|e| e.request_id == Some(request_id) && e.is_pending());
        if !owns {
            trace!(key = %key, request_id = %request_id, "dropping stale response");
            return None;
        }
        let refetch_after = match self.inner.queries_in_flight.remove(key) {
            Some(flight) => flight.refetch_after,
            None => false,
        };
        let entry = self.inner.state.queries.get_mut(key)?;
        Some((entry, refetch_after))
    }

    /// Store data, recompute provided tags and update the tag index.
    pub(crate) fn fulfill_query(
        &mut self,
        key: &CacheKey,
        request_id: RequestId,
        data: Value,
        tags: Vec<Tag>,
    ) -> Commit {
        let now = self.now();
        let Some((entry, refetch_after)) = self.settle(key, request_id) else {
            return Commit::Stale;
        };
        entry.status = QueryStatus::Fulfilled;
        entry.data = Some(data);
        entry.error = None;
        entry.fulfilled_at = Some(now);
        entry.provided_tags = tags.clone();
        entry.invalidated = refetch_after;

        self.inner.tags.replace(key, &tags);
        debug!(key = %key, request_id = %request_id, tags = tags.len(), "query fulfilled");
        self.emit(CacheEvent::QueryFulfilled {
            key: key.clone(),
            request_id,
        });
        Commit::Applied {
            invalidated: refetch_after,
        }
    }

    /// Store the error. Last known data and tags are left in place.
    pub(crate) fn reject_query(&mut self, key: &CacheKey, request_id: RequestId, error: QueryError) -> Commit {
        let Some((entry, refetch_after)) = self.settle(key, request_id) else {
            return Commit::Stale;
        };
        entry.status = QueryStatus::Rejected;
        entry.error = Some(error.clone());
        entry.invalidated |= refetch_after;

        debug!(key = %key, request_id = %request_id, error = %error, "query rejected");
        self.emit(CacheEvent::QueryRejected {
            key: key.clone(),
            request_id,
            error,
        });
        Commit::Applied {
            invalidated: refetch_after,
        }
    }

    /// Evict a query and its tag associations. A request still in flight for
    /// it will find no entry and be dropped, so eviction waits for it.
    pub(crate) fn remove_query(&mut self, key: &CacheKey) -> Option<QueryCacheEntry> {
        let entry = self.inner.state.queries.remove(key)?;
        self.inner.tags.remove(key);
        self.inner.queries_in_flight.remove(key);
        debug!(key = %key, "query removed");
        self.emit(CacheEvent::QueryRemoved { key: key.clone() });
        Some(entry)
    }

    /// Apply patches to a key's cached data. Returns false when there is no
    /// data to patch.
    pub(crate) fn patch_query(&mut self, key: &CacheKey, patches: &[Patch]) -> Result<bool, PatchError> {
        let Some(data) = self
            .inner
            .state
            .queries
            .get_mut(key)
            .and_then(|e| e.data.as_mut())
        else {
            return Ok(false);
        };
        if patches.is_empty() {
            return Ok(true);
        }
        patch::apply_atomic(data, patches)?;
        self.emit(CacheEvent::QueryPatched { key: key.clone() });
        Ok(true)
    }

    /// Mark every key providing one of `tags` as invalidated.
    ///
    /// Settled entries get `invalidated = true`; a pending entry has its
    /// running request flagged instead so the mark survives its commit.
    pub(crate) fn invalidate_tags(&mut self, tags: &[Tag]) -> Vec<CacheKey> {
        let keys: Vec<CacheKey> = self.inner.tags.keys_for(tags).into_iter().collect();
        for key in &keys {
            match self.inner.queries_in_flight.get_mut(key) {
                Some(flight) => flight.refetch_after = true,
                None => {
                    if let Some(entry) = self.inner.state.queries.get_mut(key) {
                        entry.invalidated = true;
                    }
                }
            }
            self.emit(CacheEvent::QueryInvalidated { key: key.clone() });
        }
        if !keys.is_empty() {
            debug!(keys = keys.len(), "tags invalidated");
        }
        keys
    }

    pub(crate) fn start_mutation(
        &mut self,
        request_id: RequestId,
        endpoint: &str,
        args: &Value,
        controller: AbortController,
        track: bool,
    ) {
        self.inner.mutations_in_flight.insert(request_id, controller);
        if track {
            let entry = MutationCacheEntry {
                endpoint_name: endpoint.to_string(),
                status: QueryStatus::Pending,
                original_args: args.clone(),
                request_id,
                data: None,
                error: None,
                started_at: Some(self.now()),
                fulfilled_at: None,
            };
            self.inner.state.mutations.insert(request_id, entry);
        }
        debug!(endpoint = %endpoint, request_id = %request_id, "mutation started");
        self.emit(CacheEvent::MutationPending {
            request_id,
            endpoint: endpoint.to_string(),
        });
    }

    pub(crate) fn fulfill_mutation(&mut self, request_id: RequestId, data: Value) {
        let now = self.now();
        self.inner.mutations_in_flight.remove(&request_id);
        if let Some(entry) = self.inner.state.mutations.get_mut(&request_id) {
            entry.status = QueryStatus::Fulfilled;
            entry.data = Some(data);
            entry.error = None;
            entry.fulfilled_at = Some(now);
        }
        self.emit(CacheEvent::MutationFulfilled { request_id });
    }

    pub(crate) fn reject_mutation(&mut self, request_id: RequestId, error: QueryError) {
        self.inner.mutations_in_flight.remove(&request_id);
        if let Some(entry) = self.inner.state.mutations.get_mut(&request_id) {
            entry.status = QueryStatus::Rejected;
            entry.error = Some(error.clone());
        }
        self.emit(CacheEvent::MutationRejected { request_id, error });
    }

    pub(crate) fn remove_mutation(&mut self, request_id: RequestId) -> Option<MutationCacheEntry> {
        let entry = self.inner.state.mutations.remove(&request_id)?;
        self.emit(CacheEvent::MutationRemoved { request_id });
        Some(entry)
    }

    pub(crate) fn set_environment(&mut self, environment: Environment) {
        if self.inner.state.environment == environment {
            return;
        }
        self.inner.state.environment = environment;
        self.emit(CacheEvent::EnvironmentChanged { environment });
    }

    /// Drop every query, mutation, tag association and GC timer.
    /// Subscriptions and their pollers survive.
    pub(crate) fn reset(&mut self) {
        self.inner.state.queries.clear();
        self.inner.state.mutations.clear();
        self.inner.tags.clear();
        self.inner.queries_in_flight.clear();
        self.inner.subscriptions.cancel_all_gc();
        debug!("api state reset");
        self.emit(CacheEvent::Reset);
    }
}

/// The outcome a settled entry hands to late readers.
pub(crate) fn entry_outcome(entry: &QueryCacheEntry) -> QueryOutcome {
    match entry.status {
        QueryStatus::Fulfilled => entry.data.clone().ok_or(QueryError::Uninitialized),
        QueryStatus::Rejected => Err(entry.error.clone().unwrap_or(QueryError::Uninitialized)),
        QueryStatus::Pending | QueryStatus::Uninitialized => Err(QueryError::Uninitialized),
    }
}
