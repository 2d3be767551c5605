//! The cache engine.
//!
//! [`Engine`] is a cheap, cloneable handle around shared state. Every public
//! operation either reads a snapshot or runs one store transaction; transport
//! calls run on spawned tasks and settle through another transaction.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, validate_refetch};
use crate::endpoint::{
    AbortController, AbortSignal, BaseQuery, CallContext, EndpointDefinition, EndpointKind, Fetcher,
    MutationDefinition, QueryDefinition, RequestContext, is_valid_endpoint_name,
};
use crate::error::{EngineError, QueryError};
use crate::handle::{Dispatch, MutationHandle, MutationOptions, QueryHandle, await_outcome};
use crate::key::{CacheKey, KeyCodec};
use crate::lifecycle::{Commit, StartOutcome, entry_outcome};
use crate::listeners::{EnvironmentEvent, EventBus};
use crate::module::{Module, ModuleRegistry};
use crate::patch::{self, Patch, PatchCollection};
use crate::policy::{FetchDecision, FetchIntent, PrefetchDecision, PrefetchOptions, evaluate, prefetch_decision};
use crate::store::{CacheEvent, Store, Transaction};
use crate::subscription::{SubscriptionId, SubscriptionOptions};
use crate::tags::{Tag, TagContext, TagDescription};
use crate::types::{CacheState, MutationCacheEntry, QueryCacheEntry, QueryOutcome, QueryStatus, Refetch, RequestId};

type Endpoints = HashMap<String, Arc<EndpointDefinition>>;

struct EngineInner {
    store: Store,
    endpoints: RwLock<Endpoints>,
    base_query: Option<Arc<dyn BaseQuery>>,
    codec: KeyCodec,
    events: EventBus,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(task) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// The data-fetching and caching engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("endpoints", &self.endpoint_names())
            .field("modules", self.inner.store.modules())
            .finish_non_exhaustive()
    }
}

/// Everything a spawned query task needs.
struct QueryRun {
    key: CacheKey,
    endpoint: String,
    definition: Arc<EndpointDefinition>,
    args: Value,
    request_id: RequestId,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    base_query: Option<Arc<dyn BaseQuery>>,
    endpoints: Vec<(String, EndpointDefinition)>,
    codec: KeyCodec,
    clock: Arc<dyn Clock>,
    modules: Vec<(Arc<dyn Module>, Arc<dyn Any + Send + Sync>)>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            base_query: None,
            endpoints: Vec::new(),
            codec: KeyCodec::default(),
            clock: Arc::new(SystemClock),
            modules: Vec::new(),
        }
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport used by endpoints defined with `request`.
    pub fn base_query(mut self, base_query: impl BaseQuery + 'static) -> Self {
        self.base_query = Some(Arc::new(base_query));
        self
    }

    pub fn endpoint(mut self, name: impl Into<String>, definition: impl Into<EndpointDefinition>) -> Self {
        self.endpoints.push((name.into(), definition.into()));
        self
    }

    pub fn query(self, name: impl Into<String>, definition: QueryDefinition) -> Self {
        self.endpoint(name, definition)
    }

    pub fn mutation(self, name: impl Into<String>, definition: MutationDefinition) -> Self {
        self.endpoint(name, definition)
    }

    /// Replace the default cache key serializer.
    pub fn serialize_query_args<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) -> CacheKey + Send + Sync + 'static,
    {
        self.codec = KeyCodec::custom(f);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Add a module. Modules see endpoints and events in registration order.
    pub fn module<M: Module + 'static>(mut self, module: M) -> Self {
        let module = Arc::new(module);
        self.modules.push((
            module.clone() as Arc<dyn Module>,
            module as Arc<dyn Any + Send + Sync>,
        ));
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;

        let mut endpoints = Endpoints::new();
        for (name, definition) in self.endpoints {
            if !is_valid_endpoint_name(&name) {
                return Err(EngineError::InvalidEndpointName(name));
            }
            if endpoints.contains_key(&name) {
                return Err(EngineError::DuplicateEndpoint(name));
            }
            endpoints.insert(name, Arc::new(definition));
        }

        let modules = ModuleRegistry::from_modules(self.modules);
        let mut names: Vec<&String> = endpoints.keys().collect();
        names.sort();
        for name in names {
            modules.inject_endpoint(name, &endpoints[name]);
        }

        info!(
            endpoints = endpoints.len(),
            modules = ?modules.names(),
            "engine built"
        );
        Ok(Engine {
            inner: Arc::new(EngineInner {
                store: Store::new(self.config, modules, self.clock),
                endpoints: RwLock::new(endpoints),
                base_query: self.base_query,
                codec: self.codec,
                events: EventBus::new(),
                listener: Mutex::new(None),
            }),
        })
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Register more endpoints. All names are checked before any is added.
    pub fn inject_endpoints<I, N>(&self, endpoints: I, override_existing: bool) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = (N, EndpointDefinition)>,
        N: Into<String>,
    {
        let incoming: Vec<(String, EndpointDefinition)> =
            endpoints.into_iter().map(|(n, d)| (n.into(), d)).collect();

        let mut registry = self.endpoints_write();
        let mut seen = std::collections::HashSet::new();
        for (name, _) in &incoming {
            if !is_valid_endpoint_name(name) {
                return Err(EngineError::InvalidEndpointName(name.clone()));
            }
            if !seen.insert(name.as_str()) || (!override_existing && registry.contains_key(name)) {
                return Err(EngineError::DuplicateEndpoint(name.clone()));
            }
        }

        for (name, definition) in incoming {
            self.inner.store.modules().inject_endpoint(&name, &definition);
            debug!(endpoint = %name, kind = %definition.kind(), "endpoint injected");
            registry.insert(name, Arc::new(definition));
        }
        Ok(())
    }

    /// Registered endpoint names, sorted.
    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints_read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn endpoint_kind(&self, name: &str) -> Option<EndpointKind> {
        self.endpoints_read().get(name).map(|d| d.kind())
    }

    fn definition(&self, name: &str, expected: EndpointKind) -> Result<Arc<EndpointDefinition>, EngineError> {
        let registry = self.endpoints_read();
        let definition = registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownEndpoint(name.to_string()))?;
        if definition.kind() != expected {
            return Err(EngineError::WrongKind {
                name: name.to_string(),
                expected,
                actual: definition.kind(),
            });
        }
        Ok(Arc::clone(definition))
    }

    fn endpoints_read(&self) -> std::sync::RwLockReadGuard<'_, Endpoints> {
        self.inner.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoints_write(&self) -> std::sync::RwLockWriteGuard<'_, Endpoints> {
        self.inner.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cache key for a query endpoint and arguments.
    pub fn cache_key(&self, endpoint: &str, args: impl Serialize) -> Result<CacheKey, EngineError> {
        self.definition(endpoint, EndpointKind::Query)?;
        let args = serde_json::to_value(args)?;
        Ok(self.inner.codec.key(endpoint, &args))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Subscribe to a query and fetch it if the refetch policy says so.
    #[tracing::instrument(skip(self, args, options), fields(endpoint = %endpoint))]
    pub async fn initiate_query(
        &self,
        endpoint: &str,
        args: impl Serialize,
        options: SubscriptionOptions,
    ) -> Result<QueryHandle, EngineError> {
        let args = serde_json::to_value(args)?;
        let definition = self.definition(endpoint, EndpointKind::Query)?;
        if let Some(refetch) = options.force_refetch {
            validate_refetch("forceRefetch", refetch)?;
        }
        if let Some(refetch) = options.refetch_on_mount_or_arg_change {
            validate_refetch("refetchOnMountOrArgChange", refetch)?;
        }
        let key = self.inner.codec.key(endpoint, &args);

        if options.skip {
            trace!(key = %key, "query skipped");
            return Ok(QueryHandle::new(
                self.clone(),
                key,
                endpoint,
                args,
                None,
                Dispatch::Ready(Err(QueryError::Uninitialized)),
            ));
        }

        let intent = FetchIntent {
            force_refetch: options.force_refetch,
            subscribe: true,
            refetch_on_mount_or_arg_change: options.refetch_on_mount_or_arg_change,
        };
        let (subscription, dispatch) = self
            .inner
            .store
            .transaction(|tx| {
                let id = tx.subscriptions_mut().add(&key, endpoint, &args, options);
                tx.emit(CacheEvent::Subscribed {
                    key: key.clone(),
                    subscription: id,
                });
                self.reconcile_poller(tx, &key);
                let dispatch = self.dispatch_query(tx, &key, endpoint, definition, &args, intent);
                (id, dispatch)
            })
            .await;

        Ok(QueryHandle::new(
            self.clone(),
            key,
            endpoint,
            args,
            Some(subscription),
            dispatch,
        ))
    }

    /// Run a query without subscribing to it.
    #[tracing::instrument(skip(self, args), fields(endpoint = %endpoint))]
    pub async fn fetch_query(
        &self,
        endpoint: &str,
        args: impl Serialize,
        force_refetch: Option<Refetch>,
    ) -> Result<QueryHandle, EngineError> {
        let args = serde_json::to_value(args)?;
        let definition = self.definition(endpoint, EndpointKind::Query)?;
        if let Some(refetch) = force_refetch {
            validate_refetch("forceRefetch", refetch)?;
        }
        let key = self.inner.codec.key(endpoint, &args);
        let intent = FetchIntent {
            force_refetch,
            ..FetchIntent::default()
        };

        let dispatch = self
            .inner
            .store
            .transaction(|tx| self.dispatch_query(tx, &key, endpoint, definition, &args, intent))
            .await;
        Ok(QueryHandle::new(self.clone(), key, endpoint, args, None, dispatch))
    }

    /// Fetch ahead of a subscriber. Returns `None` when the cached value is
    /// fresh enough.
    #[tracing::instrument(skip(self, args), fields(endpoint = %endpoint))]
    pub async fn prefetch(
        &self,
        endpoint: &str,
        args: impl Serialize,
        options: PrefetchOptions,
    ) -> Result<Option<QueryHandle>, EngineError> {
        let args = serde_json::to_value(args)?;
        let definition = self.definition(endpoint, EndpointKind::Query)?;
        if let PrefetchOptions::IfOlderThan(secs) = options {
            validate_refetch("ifOlderThan", Refetch::IfOlderThan(secs))?;
        }
        let key = self.inner.codec.key(endpoint, &args);

        let dispatch = self
            .inner
            .store
            .transaction(|tx| match prefetch_decision(tx.query(&key), options, tx.now()) {
                PrefetchDecision::Skip => None,
                PrefetchDecision::Initiate(force) => {
                    let intent = FetchIntent {
                        force_refetch: Some(force),
                        ..FetchIntent::default()
                    };
                    Some(self.dispatch_query(tx, &key, endpoint, definition, &args, intent))
                }
            })
            .await;

        if dispatch.is_none() {
            debug!(key = %key, "prefetch skipped, cached value is fresh");
        }
        Ok(dispatch.map(|d| QueryHandle::new(self.clone(), key, endpoint, args, None, d)))
    }

    /// Withdraw a consumer. When the last one leaves, the entry is scheduled
    /// for eviction after `keepUnusedDataFor`.
    pub async fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.inner
            .store
            .transaction(|tx| {
                let Some((key, remaining)) = tx.subscriptions_mut().remove(subscription) else {
                    return false;
                };
                tx.emit(CacheEvent::Unsubscribed {
                    key: key.clone(),
                    subscription,
                });
                self.reconcile_poller(tx, &key);
                if remaining == 0 {
                    self.schedule_gc(tx, &key);
                }
                true
            })
            .await
    }

    /// Change polling and refetch options of a live subscription.
    pub async fn update_subscription_options(
        &self,
        subscription: SubscriptionId,
        options: SubscriptionOptions,
    ) -> Result<bool, EngineError> {
        if let Some(refetch) = options.refetch_on_mount_or_arg_change {
            validate_refetch("refetchOnMountOrArgChange", refetch)?;
        }
        Ok(self
            .inner
            .store
            .transaction(|tx| match tx.subscriptions_mut().update(subscription, options) {
                Some(key) => {
                    self.reconcile_poller(tx, &key);
                    true
                }
                None => false,
            })
            .await)
    }

    /// Await the request currently in flight for a key, if any.
    pub async fn wait_for_query(
        &self,
        endpoint: &str,
        args: impl Serialize,
    ) -> Result<Option<QueryOutcome>, EngineError> {
        let key = self.cache_key(endpoint, args)?;
        let pending = self
            .inner
            .store
            .read(|inner| inner.queries_in_flight.get(&key).map(|f| f.result.clone()))
            .await;
        match pending {
            Some(rx) => Ok(Some(await_outcome(rx).await)),
            None => Ok(None),
        }
    }

    /// Evaluate the refetch policy for a key and start, join or serve.
    fn dispatch_query(
        &self,
        tx: &mut Transaction<'_>,
        key: &CacheKey,
        endpoint: &str,
        definition: Arc<EndpointDefinition>,
        args: &Value,
        intent: FetchIntent,
    ) -> Dispatch {
        let decision = evaluate(
            tx.query(key),
            &intent,
            tx.config().refetch_on_mount_or_arg_change,
            tx.now(),
        );
        trace!(key = %key, ?decision, "refetch policy evaluated");

        match decision {
            FetchDecision::ServeCached => Dispatch::Ready(cached_outcome(tx, key)),
            FetchDecision::JoinInFlight => join(tx, key),
            FetchDecision::Fetch => {
                let request_id = RequestId::new();
                let controller = AbortController::new();
                let (done, result) = watch::channel(None);
                match tx.start_query(key, endpoint, args, request_id, controller.clone(), result.clone()) {
                    StartOutcome::AlreadyPending(_) => join(tx, key),
                    StartOutcome::Started => {
                        let run = QueryRun {
                            key: key.clone(),
                            endpoint: endpoint.to_string(),
                            definition,
                            args: args.clone(),
                            request_id,
                        };
                        tokio::spawn(self.clone().run_query(run, controller.signal(), done));
                        Dispatch::InFlight {
                            request_id,
                            controller,
                            result,
                        }
                    }
                }
            }
        }
    }

    /// Force a refetch of a key from inside a transaction.
    fn refetch_in(&self, tx: &mut Transaction<'_>, key: &CacheKey) -> Option<Dispatch> {
        let (endpoint, args) = match tx.query(key) {
            Some(entry) => (entry.endpoint_name.clone(), entry.original_args.clone()),
            None => {
                let (endpoint, args) = tx.subscriptions().origin(key)?;
                (endpoint.to_string(), args.clone())
            }
        };
        let definition = match self.definition(&endpoint, EndpointKind::Query) {
            Ok(definition) => definition,
            Err(e) => {
                warn!(key = %key, error = %e, "cannot refetch");
                return None;
            }
        };
        Some(self.dispatch_query(tx, key, &endpoint, definition, &args, FetchIntent::forced()))
    }

    async fn refetch_key(&self, key: &CacheKey) {
        self.inner
            .store
            .transaction(|tx| {
                self.refetch_in(tx, key);
            })
            .await;
    }

    fn run_query(self, run: QueryRun, signal: AbortSignal, done: watch::Sender<Option<QueryOutcome>>) -> BoxFuture<'static, ()> {
        async move {
            let QueryRun {
                key,
                endpoint,
                definition,
                args,
                request_id,
            } = run;

            let outcome = self.execute(&endpoint, &definition, &args, request_id, signal).await;
            let tags = match &outcome {
                Ok(data) => evaluate_tags(definition.tags(), Some(data), None, &args),
                Err(_) => Vec::new(),
            };

            self.inner
                .store
                .transaction(|tx| {
                    let commit = match &outcome {
                        Ok(data) => tx.fulfill_query(&key, request_id, data.clone(), tags),
                        Err(error) => tx.reject_query(&key, request_id, error.clone()),
                    };
                    let Commit::Applied { invalidated } = commit else {
                        return;
                    };
                    let subscribed = tx.subscriptions().count(&key) > 0;
                    if !subscribed && !tx.subscriptions().has_gc(&key) {
                        self.schedule_gc(tx, &key);
                    }
                    if invalidated && subscribed {
                        debug!(key = %key, "refetching entry invalidated while in flight");
                        self.refetch_in(tx, &key);
                    }
                })
                .await;

            done.send_replace(Some(outcome));
        }
        .boxed()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Run a mutation. Mutations are never deduplicated.
    #[tracing::instrument(skip(self, args, options), fields(endpoint = %endpoint))]
    pub async fn initiate_mutation(
        &self,
        endpoint: &str,
        args: impl Serialize,
        options: MutationOptions,
    ) -> Result<MutationHandle, EngineError> {
        let args = serde_json::to_value(args)?;
        let definition = self.definition(endpoint, EndpointKind::Mutation)?;
        let request_id = RequestId::new();
        let controller = AbortController::new();
        let (done, result) = watch::channel(None);

        self.inner
            .store
            .transaction(|tx| tx.start_mutation(request_id, endpoint, &args, controller.clone(), options.track))
            .await;

        let run = QueryRun {
            key: CacheKey::new(request_id.to_string()),
            endpoint: endpoint.to_string(),
            definition,
            args,
            request_id,
        };
        tokio::spawn(self.clone().run_mutation(run, controller.signal(), done));

        Ok(MutationHandle {
            engine: self.clone(),
            request_id,
            controller,
            result,
        })
    }

    fn run_mutation(
        self,
        run: QueryRun,
        signal: AbortSignal,
        done: watch::Sender<Option<QueryOutcome>>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let QueryRun {
                endpoint,
                definition,
                args,
                request_id,
                ..
            } = run;

            let outcome = self.execute(&endpoint, &definition, &args, request_id, signal).await;
            let tags = match &outcome {
                Ok(data) => evaluate_tags(definition.tags(), Some(data), None, &args),
                Err(_) => Vec::new(),
            };

            self.inner
                .store
                .transaction(|tx| {
                    match &outcome {
                        Ok(data) => tx.fulfill_mutation(request_id, data.clone()),
                        Err(error) => tx.reject_mutation(request_id, error.clone()),
                    }
                    self.propagate_invalidation(tx, &tags);
                })
                .await;

            done.send_replace(Some(outcome));
        }
        .boxed()
    }

    /// Remove a mutation's cache entry.
    pub async fn remove_mutation(&self, request_id: RequestId) -> bool {
        self.inner
            .store
            .transaction(|tx| tx.remove_mutation(request_id).is_some())
            .await
    }

    // =========================================================================
    // Invalidation and manual cache updates
    // =========================================================================

    /// Invalidate tags: mark every providing entry stale and refetch the
    /// subscribed ones. Returns the affected keys.
    pub async fn invalidate_tags<I, T>(&self, tags: I) -> Vec<CacheKey>
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        let tags: Vec<Tag> = tags.into_iter().map(Into::into).collect();
        self.inner
            .store
            .transaction(|tx| self.propagate_invalidation(tx, &tags))
            .await
    }

    fn propagate_invalidation(&self, tx: &mut Transaction<'_>, tags: &[Tag]) -> Vec<CacheKey> {
        if tags.is_empty() {
            return Vec::new();
        }
        let keys = tx.invalidate_tags(tags);
        for key in &keys {
            if tx.subscriptions().count(key) > 0 {
                // A pending key joins here and refetches once it settles.
                self.refetch_in(tx, key);
            }
        }
        keys
    }

    /// Apply `recipe` to the cached value and return the patches it produced.
    ///
    /// A missing entry (or one without data yet) is left alone and yields an
    /// empty collection.
    pub async fn update_query_result<F>(
        &self,
        endpoint: &str,
        args: impl Serialize,
        recipe: F,
    ) -> Result<PatchCollection, EngineError>
    where
        F: FnOnce(&mut Value),
    {
        let key = self.cache_key(endpoint, args)?;
        self.inner
            .store
            .transaction(|tx| {
                let Some(before) = tx.query(&key).and_then(|e| e.data.clone()) else {
                    return Ok(PatchCollection::empty(key));
                };
                let mut after = before.clone();
                recipe(&mut after);

                let (patches, inverse_patches) = patch::diff(&before, &after);
                tx.patch_query(&key, &patches)?;
                Ok(PatchCollection {
                    cache_key: key,
                    patches,
                    inverse_patches,
                    engine: Some(self.clone()),
                })
            })
            .await
    }

    /// Apply patches to a cached value. Returns false when there is no data.
    pub async fn patch_query_result(
        &self,
        endpoint: &str,
        args: impl Serialize,
        patches: Vec<Patch>,
    ) -> Result<bool, EngineError> {
        let key = self.cache_key(endpoint, args)?;
        self.patch_key(&key, patches).await
    }

    pub(crate) async fn patch_key(&self, key: &CacheKey, patches: Vec<Patch>) -> Result<bool, EngineError> {
        self.inner
            .store
            .transaction(|tx| tx.patch_query(key, &patches))
            .await
            .map_err(EngineError::from)
    }

    // =========================================================================
    // Garbage collection and polling
    // =========================================================================

    fn schedule_gc(&self, tx: &mut Transaction<'_>, key: &CacheKey) {
        let origin = match tx.query(key) {
            Some(entry) => Some((entry.endpoint_name.clone(), entry.original_args.clone())),
            None => tx
                .subscriptions()
                .origin(key)
                .map(|(e, a)| (e.to_string(), a.clone())),
        };
        let Some((endpoint, args)) = origin else {
            return;
        };
        let delay = tx.config().keep_unused_duration();
        let task = tokio::spawn(collect_after(Arc::downgrade(&self.inner), key.clone(), delay));
        tx.subscriptions_mut().schedule_gc(key, &endpoint, &args, task);
        trace!(key = %key, ?delay, "eviction scheduled");
    }

    async fn collect(&self, key: &CacheKey) {
        self.inner
            .store
            .transaction(|tx| {
                // A request still in flight reschedules eviction once it settles.
                if tx.in_flight(key).is_some() && tx.subscriptions().count(key) == 0 {
                    tx.subscriptions_mut().release_gc(key);
                    trace!(key = %key, "eviction deferred until request settles");
                    return;
                }
                if tx.subscriptions_mut().forget(key) && tx.remove_query(key).is_some() {
                    debug!(key = %key, "evicted unused query");
                }
            })
            .await;
    }

    /// Start, restart or stop the key's poller to match its subscriptions.
    fn reconcile_poller(&self, tx: &mut Transaction<'_>, key: &CacheKey) {
        let desired = tx.subscriptions().polling_interval(key);
        if desired == tx.subscriptions().poller_interval(key) {
            return;
        }
        match desired {
            Some(interval) => {
                let task = tokio::spawn(poll(Arc::downgrade(&self.inner), key.clone(), interval));
                tx.subscriptions_mut().set_poller(key, interval, task);
                debug!(key = %key, ?interval, "polling started");
            }
            None => {
                tx.subscriptions_mut().stop_poller(key);
                debug!(key = %key, "polling stopped");
            }
        }
    }

    // =========================================================================
    // Environment
    // =========================================================================

    /// The environment event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Start listening to the environment event bus. Idempotent.
    pub fn init(&self) {
        let mut listener = self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return;
        }
        let rx = self.inner.events.subscribe();
        *listener = Some(tokio::spawn(listen(Arc::downgrade(&self.inner), rx)));
        debug!("environment listener started");
    }

    /// Stop the listener, every timer and poller, and abort in-flight requests.
    pub async fn teardown(&self) {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = listener {
            task.abort();
        }

        let controllers = self
            .inner
            .store
            .transaction(|tx| {
                tx.subscriptions_mut().shutdown();
                let mut controllers: Vec<AbortController> = tx
                    .inner
                    .queries_in_flight
                    .values()
                    .map(|f| f.controller.clone())
                    .collect();
                controllers.extend(tx.inner.mutations_in_flight.values().cloned());
                controllers
            })
            .await;
        let aborted = controllers.len();
        for controller in controllers {
            controller.abort();
        }

        self.inner.store.modules().teardown();
        info!(aborted, "engine torn down");
    }

    async fn handle_environment(&self, event: EnvironmentEvent) {
        debug!(?event, "environment event");
        self.inner
            .store
            .transaction(|tx| {
                let mut environment = tx.environment();
                let refetch = match event {
                    EnvironmentEvent::Focus => {
                        environment.focused = true;
                        let default = tx.config().refetch_on_focus;
                        tx.subscriptions()
                            .keys_where(|o| o.refetch_on_focus.unwrap_or(default))
                    }
                    EnvironmentEvent::Online => {
                        environment.online = true;
                        let default = tx.config().refetch_on_reconnect;
                        tx.subscriptions()
                            .keys_where(|o| o.refetch_on_reconnect.unwrap_or(default))
                    }
                    EnvironmentEvent::FocusLost => {
                        environment.focused = false;
                        Vec::new()
                    }
                    EnvironmentEvent::Offline => {
                        environment.online = false;
                        Vec::new()
                    }
                };
                tx.set_environment(environment);

                for key in refetch {
                    let started = tx
                        .query(&key)
                        .is_some_and(|e| e.status != QueryStatus::Uninitialized);
                    if started {
                        self.refetch_in(tx, &key);
                    }
                }
            })
            .await;
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Drop all cached queries, mutations and tag associations.
    /// Subscriptions are kept.
    pub async fn reset_api_state(&self) {
        self.inner.store.transaction(|tx| tx.reset()).await;
        info!("api state reset");
    }

    /// Immutable copy of the whole serializable state.
    pub async fn snapshot(&self) -> CacheState {
        self.inner.store.snapshot().await
    }

    pub async fn config(&self) -> EngineConfig {
        self.inner.store.read(|inner| inner.state.config.clone()).await
    }

    pub async fn query_state(
        &self,
        endpoint: &str,
        args: impl Serialize,
    ) -> Result<Option<QueryCacheEntry>, EngineError> {
        let key = self.cache_key(endpoint, args)?;
        Ok(self.query_entry(&key).await)
    }

    pub async fn query_entry(&self, key: &CacheKey) -> Option<QueryCacheEntry> {
        self.inner
            .store
            .read(|inner| inner.state.queries.get(key).cloned())
            .await
    }

    pub async fn mutation_state(&self, request_id: RequestId) -> Option<MutationCacheEntry> {
        self.inner
            .store
            .read(|inner| inner.state.mutations.get(&request_id).cloned())
            .await
    }

    pub async fn subscription_count(&self, key: &CacheKey) -> usize {
        self.inner
            .store
            .read(|inner| inner.subscriptions.count(key))
            .await
    }

    /// Keys whose tag associations include `tag`.
    pub async fn keys_for_tag(&self, tag: impl Into<Tag>) -> Vec<CacheKey> {
        let tag = tag.into();
        self.inner
            .store
            .read(|inner| inner.tags.keys_for(&[tag]).into_iter().collect())
            .await
    }

    /// Receive every committed cache event.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.store.subscribe()
    }

    /// Look up a module by type.
    pub fn module<M: Module + 'static>(&self) -> Option<Arc<M>> {
        self.inner.store.modules().get::<M>()
    }

    pub(crate) fn base_query(&self) -> Option<&Arc<dyn BaseQuery>> {
        self.inner.base_query.as_ref()
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run one request through callbacks and transport, racing the abort
    /// signal. Never panics; every failure comes back as a `QueryError`.
    ///
    /// Order: `on_start`, transport, `on_success` with the raw transport
    /// data, then `transform_response`. A failure (or panic) in any of these
    /// steps runs `on_error` once with the resulting error. A panic inside
    /// `on_error` itself is only logged and does not replace that error.
    async fn execute(
        &self,
        endpoint: &str,
        definition: &EndpointDefinition,
        args: &Value,
        request_id: RequestId,
        signal: AbortSignal,
    ) -> QueryOutcome {
        let common = definition.common().clone();
        let fetcher = match (&common.fetcher, self.base_query()) {
            (None, _) => {
                return Err(QueryError::Definition(format!(
                    "endpoint `{endpoint}` defines neither `request` nor `query_fn`"
                )));
            }
            (Some(Fetcher::Request(_)), None) => {
                return Err(QueryError::Definition(format!(
                    "endpoint `{endpoint}` builds a transport request but no base query is configured"
                )));
            }
            (Some(fetcher), _) => fetcher.clone(),
        };

        let ctx = CallContext::new(self.clone(), endpoint.to_string(), args.clone(), request_id);
        let request_ctx = RequestContext {
            engine: self.clone(),
            endpoint: endpoint.to_string(),
            signal: signal.clone(),
        };
        let base_query = self.base_query().cloned();
        let args = args.clone();

        let pipeline = async move {
            let fetched = async {
                if let Some(on_start) = &common.on_start {
                    guard(on_start(ctx.clone())).await?;
                }
                let raw = match fetcher {
                    Fetcher::Request(build) => {
                        let request = guard_sync(|| build(&args))?;
                        let base_query = base_query.ok_or_else(|| {
                            QueryError::Definition("no base query is configured".into())
                        })?;
                        guard(base_query.execute(request, request_ctx, common.extra_options.clone())).await?
                    }
                    Fetcher::QueryFn(query_fn) => {
                        let fut = guard_sync(|| query_fn(args.clone(), request_ctx))?;
                        guard(fut).await?
                    }
                };
                let data = raw.map_err(QueryError::Transport)?;
                if let Some(on_success) = &common.on_success {
                    guard(on_success(ctx.clone(), data.clone())).await?;
                }
                let data = match &common.transform_response {
                    Some(transform) => guard_sync(|| transform(data))?,
                    None => data,
                };
                Ok::<Value, QueryError>(data)
            }
            .await;

            if let (Err(error), Some(on_error)) = (&fetched, &common.on_error) {
                if let Err(panic) = guard(on_error(ctx, error.clone())).await {
                    warn!(error = %panic, "on_error callback failed");
                }
            }
            fetched
        };

        tokio::select! {
            outcome = pipeline => outcome,
            () = signal.aborted() => {
                debug!(request_id = %request_id, "request aborted");
                Err(QueryError::Aborted)
            }
        }
    }
}

fn cached_outcome(tx: &Transaction<'_>, key: &CacheKey) -> QueryOutcome {
    tx.query(key)
        .map(entry_outcome)
        .unwrap_or(Err(QueryError::Uninitialized))
}

fn join(tx: &Transaction<'_>, key: &CacheKey) -> Dispatch {
    match tx.in_flight(key) {
        Some(flight) => Dispatch::InFlight {
            request_id: flight.request_id,
            controller: flight.controller.clone(),
            result: flight.result.clone(),
        },
        None => Dispatch::Ready(cached_outcome(tx, key)),
    }
}

/// Evaluate a tag description, treating a panic as "no tags".
fn evaluate_tags(
    description: Option<&TagDescription>,
    result: Option<&Value>,
    error: Option<&QueryError>,
    args: &Value,
) -> Vec<Tag> {
    let Some(description) = description else {
        return Vec::new();
    };
    let ctx = TagContext { result, error, args };
    guard_sync(|| description.evaluate(ctx)).unwrap_or_else(|e| {
        warn!(error = %e, "tag description failed");
        Vec::new()
    })
}

async fn guard<T>(fut: impl Future<Output = T>) -> Result<T, QueryError> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| QueryError::Unexpected(panic_message(panic.as_ref())))
}

fn guard_sync<T>(f: impl FnOnce() -> T) -> Result<T, QueryError> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|panic| QueryError::Unexpected(panic_message(panic.as_ref())))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn collect_after(engine: Weak<EngineInner>, key: CacheKey, delay: Duration) -> BoxFuture<'static, ()> {
    async move {
        sleep(delay).await;
        if let Some(inner) = engine.upgrade() {
            Engine { inner }.collect(&key).await;
        }
    }
    .boxed()
}

fn poll(engine: Weak<EngineInner>, key: CacheKey, interval: Duration) -> BoxFuture<'static, ()> {
    async move {
        loop {
            sleep(interval).await;
            let Some(inner) = engine.upgrade() else {
                break;
            };
            trace!(key = %key, "polling");
            Engine { inner }.refetch_key(&key).await;
        }
    }
    .boxed()
}

fn listen(engine: Weak<EngineInner>, mut rx: broadcast::Receiver<EnvironmentEvent>) -> BoxFuture<'static, ()> {
    async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(inner) = engine.upgrade() else {
                        break;
                    };
                    Engine { inner }.handle_environment(event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "environment listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::base_query_fn;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::builder()
            .base_query(base_query_fn(|request, _ctx, _extra| async move { Ok(request) }))
            .query("echo", QueryDefinition::new().request(|args| args.clone()))
            .mutation("touch", MutationDefinition::new().request(|args| args.clone()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_bad_names() {
        let err = Engine::builder()
            .query("get(user", QueryDefinition::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidEndpointName(_)));

        let err = Engine::builder()
            .query("getUser", QueryDefinition::new())
            .query("getUser", QueryDefinition::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateEndpoint(_)));
    }

    #[tokio::test]
    async fn test_wrong_kind() {
        let engine = engine();
        let err = engine
            .initiate_query("touch", json!(1), SubscriptionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::WrongKind {
                expected: EndpointKind::Query,
                actual: EndpointKind::Mutation,
                ..
            }
        ));

        let err = engine
            .initiate_mutation("nope", json!(1), MutationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownEndpoint(_)));
    }

    #[test]
    fn test_inject_endpoints() {
        let engine = engine();
        let err = engine
            .inject_endpoints([("echo", QueryDefinition::new().into())], false)
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateEndpoint(_)));

        engine
            .inject_endpoints(
                [
                    ("echo", QueryDefinition::new().into()),
                    ("other", MutationDefinition::new().into()),
                ],
                true,
            )
            .unwrap();
        assert_eq!(engine.endpoint_names(), vec!["echo", "other", "touch"]);
        assert_eq!(engine.endpoint_kind("other"), Some(EndpointKind::Mutation));
    }

    #[tokio::test]
    async fn test_skip_does_not_subscribe() {
        let engine = engine();
        let options = SubscriptionOptions {
            skip: true,
            ..SubscriptionOptions::default()
        };
        let handle = engine.initiate_query("echo", json!(1), options).await.unwrap();
        assert_eq!(handle.result().await, Err(QueryError::Uninitialized));
        assert_eq!(handle.subscription(), None);
        assert_eq!(engine.subscription_count(handle.cache_key()).await, 0);
        assert!(engine.snapshot().await.queries.is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
