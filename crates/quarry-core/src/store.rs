//! The single owned cache state and its transaction scope.
//!
//! All mutation goes through [`Store::transaction`]. Events raised inside a
//! transaction are queued and only published once the write lock has been
//! released, so observers never see a half-applied batch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::trace;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::endpoint::AbortController;
use crate::error::QueryError;
use crate::key::CacheKey;
use crate::module::ModuleRegistry;
use crate::subscription::{SubscriptionId, SubscriptionRegistry};
use crate::tags::TagIndex;
use crate::types::{CacheState, Environment, QueryCacheEntry, QueryOutcome, RequestId};

/// Broadcast channel capacity for cache events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notification published after every committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    QueryPending { key: CacheKey, request_id: RequestId },
    QueryFulfilled { key: CacheKey, request_id: RequestId },
    QueryRejected { key: CacheKey, request_id: RequestId, error: QueryError },
    QueryPatched { key: CacheKey },
    QueryInvalidated { key: CacheKey },
    QueryRemoved { key: CacheKey },
    MutationPending { request_id: RequestId, endpoint: String },
    MutationFulfilled { request_id: RequestId },
    MutationRejected { request_id: RequestId, error: QueryError },
    MutationRemoved { request_id: RequestId },
    Subscribed { key: CacheKey, subscription: SubscriptionId },
    Unsubscribed { key: CacheKey, subscription: SubscriptionId },
    EnvironmentChanged { environment: Environment },
    Reset,
}

impl CacheEvent {
    /// Short name of the event kind, used for logging and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueryPending { .. } => "query_pending",
            Self::QueryFulfilled { .. } => "query_fulfilled",
            Self::QueryRejected { .. } => "query_rejected",
            Self::QueryPatched { .. } => "query_patched",
            Self::QueryInvalidated { .. } => "query_invalidated",
            Self::QueryRemoved { .. } => "query_removed",
            Self::MutationPending { .. } => "mutation_pending",
            Self::MutationFulfilled { .. } => "mutation_fulfilled",
            Self::MutationRejected { .. } => "mutation_rejected",
            Self::MutationRemoved { .. } => "mutation_removed",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::EnvironmentChanged { .. } => "environment_changed",
            Self::Reset => "reset",
        }
    }
}

/// Bookkeeping for one transport call that has not resolved yet.
pub(crate) struct InFlight {
    pub request_id: RequestId,
    pub controller: AbortController,
    pub result: watch::Receiver<Option<QueryOutcome>>,
    /// Tags of this key were invalidated while the call was running.
    pub refetch_after: bool,
}

/// Everything guarded by the store lock.
#[derive(Default)]
pub(crate) struct StoreInner {
    pub state: CacheState,
    pub tags: TagIndex,
    pub subscriptions: SubscriptionRegistry,
    pub queries_in_flight: HashMap<CacheKey, InFlight>,
    pub mutations_in_flight: HashMap<RequestId, AbortController>,
}

/// A batch of state transitions applied under one write lock.
pub(crate) struct Transaction<'a> {
    pub(crate) inner: &'a mut StoreInner,
    pub(crate) events: Vec<CacheEvent>,
    now: DateTime<Utc>,
}

impl Transaction<'_> {
    /// The time this transaction started; every timestamp it writes uses it.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.state.config
    }

    pub fn environment(&self) -> Environment {
        self.inner.state.environment
    }

    pub fn query(&self, key: &CacheKey) -> Option<&QueryCacheEntry> {
        self.inner.state.queries.get(key)
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.inner.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionRegistry {
        &mut self.inner.subscriptions
    }

    pub fn in_flight(&self, key: &CacheKey) -> Option<&InFlight> {
        self.inner.queries_in_flight.get(key)
    }

    pub fn emit(&mut self, event: CacheEvent) {
        self.events.push(event);
    }
}

/// Owner of the cache state.
pub(crate) struct Store {
    inner: RwLock<StoreInner>,
    updates_tx: broadcast::Sender<CacheEvent>,
    modules: ModuleRegistry,
    clock: Arc<dyn Clock>,
}

impl Store {
    pub fn new(config: EngineConfig, modules: ModuleRegistry, clock: Arc<dyn Clock>) -> Self {
        let (updates_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = StoreInner {
            state: CacheState {
                config,
                ..CacheState::default()
            },
            ..StoreInner::default()
        };
        Self {
            inner: RwLock::new(inner),
            updates_tx,
            modules,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `f` under the write lock, then publish the events it raised.
    pub async fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let (result, events) = {
            let mut guard = self.inner.write().await;
            let mut tx = Transaction {
                inner: &mut *guard,
                events: Vec::new(),
                now: self.clock.now(),
            };
            let result = f(&mut tx);
            (result, tx.events)
        };
        self.publish(events);
        result
    }

    /// Run `f` under the read lock.
    pub async fn read<R>(&self, f: impl FnOnce(&StoreInner) -> R) -> R {
        let guard = self.inner.read().await;
        f(&guard)
    }

    pub async fn snapshot(&self) -> CacheState {
        self.read(|inner| inner.state.clone()).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.updates_tx.subscribe()
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    fn publish(&self, events: Vec<CacheEvent>) {
        for event in events {
            self.modules.on_event(&event);
            if self.updates_tx.send(event).is_err() {
                trace!("no subscribers for cache event");
            }
        }
    }
}
