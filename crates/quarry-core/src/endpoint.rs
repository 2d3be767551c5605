//! Endpoint definitions and the transport contract.
//!
//! An endpoint is either a query or a mutation. Both describe how to turn
//! arguments into a transport request (`request`) or fetch directly
//! (`query_fn`), plus optional response transform, tags and lifecycle hooks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::engine::Engine;
use crate::error::QueryError;
use crate::patch::PatchCollection;
use crate::tags::TagDescription;
use crate::types::{CacheState, RequestId};

/// Discriminant of [`EndpointDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Query,
    Mutation,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
        })
    }
}

/// Result of a transport call: `Ok(data)` or `Err(error value)`.
pub type TransportResult = Result<Value, Value>;

/// The pluggable transport every `request`-style endpoint goes through.
///
/// Expected failures are returned as `Err`; a panic is caught by the engine
/// and recorded as [`QueryError::Unexpected`].
#[async_trait]
pub trait BaseQuery: Send + Sync {
    async fn execute(
        &self,
        request: Value,
        ctx: RequestContext,
        extra_options: Option<Value>,
    ) -> TransportResult;
}

/// A [`BaseQuery`] backed by a closure.
pub struct FnBaseQuery<F> {
    f: F,
}

/// Wrap a closure as a transport.
pub fn base_query_fn<F, Fut>(f: F) -> FnBaseQuery<F>
where
    F: Fn(Value, RequestContext, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = TransportResult> + Send,
{
    FnBaseQuery { f }
}

#[async_trait]
impl<F, Fut> BaseQuery for FnBaseQuery<F>
where
    F: Fn(Value, RequestContext, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = TransportResult> + Send,
{
    async fn execute(
        &self,
        request: Value,
        ctx: RequestContext,
        extra_options: Option<Value>,
    ) -> TransportResult {
        (self.f)(request, ctx, extra_options).await
    }
}

/// Receiving side of an abort request.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once abort has been requested; never resolves otherwise.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        let aborted = rx.wait_for(|aborted| *aborted).await.is_ok();
        if !aborted {
            // Controller dropped without aborting.
            std::future::pending::<()>().await;
        }
    }
}

/// Sending side of an abort request.
#[derive(Debug, Clone)]
pub struct AbortController {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Passed to the transport and to `query_fn`.
#[derive(Clone)]
pub struct RequestContext {
    pub(crate) engine: Engine,
    pub(crate) endpoint: String,
    pub(crate) signal: AbortSignal,
}

impl RequestContext {
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The engine, for dispatching further operations.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Snapshot of the current cache state.
    pub async fn state(&self) -> CacheState {
        self.engine.snapshot().await
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("endpoint", &self.endpoint)
            .field("aborted", &self.signal.is_aborted())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct CallSlots {
    values: HashMap<String, Value>,
    patches: Vec<PatchCollection>,
}

/// Per-invocation context shared by `on_start`, `on_success` and `on_error`.
#[derive(Clone)]
pub struct CallContext {
    engine: Engine,
    endpoint: String,
    args: Value,
    request_id: RequestId,
    slots: Arc<Mutex<CallSlots>>,
}

impl CallContext {
    pub(crate) fn new(engine: Engine, endpoint: String, args: Value, request_id: RequestId) -> Self {
        Self {
            engine,
            endpoint,
            args,
            request_id,
            slots: Arc::default(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn state(&self) -> CacheState {
        self.engine.snapshot().await
    }

    /// Store a value for a later hook of the same call.
    pub fn insert(&self, name: impl Into<String>, value: Value) {
        self.lock().values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().values.get(name).cloned()
    }

    /// Remember an optimistic update so `undo_patches` can revert it.
    pub fn keep_patch(&self, patch: PatchCollection) {
        self.lock().patches.push(patch);
    }

    /// Revert every remembered optimistic update, newest first.
    pub async fn undo_patches(&self) {
        let patches = std::mem::take(&mut self.lock().patches);
        for patch in patches.into_iter().rev() {
            patch.undo().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CallSlots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("endpoint", &self.endpoint)
            .field("args", &self.args)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

pub type RequestBuilder = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type QueryFn = Arc<dyn Fn(Value, RequestContext) -> BoxFuture<'static, TransportResult> + Send + Sync>;
pub type TransformResponse = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type StartHook = Arc<dyn Fn(CallContext) -> BoxFuture<'static, ()> + Send + Sync>;
pub type SuccessHook = Arc<dyn Fn(CallContext, Value) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(CallContext, QueryError) -> BoxFuture<'static, ()> + Send + Sync>;

/// How an endpoint obtains its data.
#[derive(Clone)]
pub enum Fetcher {
    /// Build a request descriptor for the engine's transport.
    Request(RequestBuilder),
    /// Fetch directly, bypassing the transport.
    QueryFn(QueryFn),
}

/// Parts shared by queries and mutations.
#[derive(Clone, Default)]
pub struct EndpointCommon {
    pub fetcher: Option<Fetcher>,
    pub transform_response: Option<TransformResponse>,
    pub extra_options: Option<Value>,
    pub on_start: Option<StartHook>,
    pub on_success: Option<SuccessHook>,
    pub on_error: Option<ErrorHook>,
}

impl fmt::Debug for EndpointCommon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fetcher = match &self.fetcher {
            Some(Fetcher::Request(_)) => "request",
            Some(Fetcher::QueryFn(_)) => "query_fn",
            None => "none",
        };
        f.debug_struct("EndpointCommon")
            .field("fetcher", &fetcher)
            .field("transform_response", &self.transform_response.is_some())
            .field("extra_options", &self.extra_options)
            .field("on_start", &self.on_start.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// A read operation whose results are cached and deduplicated.
#[derive(Debug, Clone, Default)]
pub struct QueryDefinition {
    pub common: EndpointCommon,
    pub provides: Option<TagDescription>,
}

/// A write operation; never deduplicated.
#[derive(Debug, Clone, Default)]
pub struct MutationDefinition {
    pub common: EndpointCommon,
    pub invalidates: Option<TagDescription>,
}

macro_rules! common_builder_methods {
    ($ty:ty) => {
        impl $ty {
            /// Map arguments to a request descriptor for the transport.
            pub fn request<F>(mut self, f: F) -> Self
            where
                F: Fn(&Value) -> Value + Send + Sync + 'static,
            {
                self.common.fetcher = Some(Fetcher::Request(Arc::new(f)));
                self
            }

            /// Fetch with a custom async function instead of the transport.
            pub fn query_fn<F, Fut>(mut self, f: F) -> Self
            where
                F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = TransportResult> + Send + 'static,
            {
                self.common.fetcher = Some(Fetcher::QueryFn(Arc::new(move |args, ctx| {
                    f(args, ctx).boxed()
                })));
                self
            }

            pub fn transform_response<F>(mut self, f: F) -> Self
            where
                F: Fn(Value) -> Value + Send + Sync + 'static,
            {
                self.common.transform_response = Some(Arc::new(f));
                self
            }

            /// Opaque options handed to the transport with every request.
            pub fn extra_options(mut self, options: Value) -> Self {
                self.common.extra_options = Some(options);
                self
            }

            pub fn on_start<F, Fut>(mut self, f: F) -> Self
            where
                F: Fn(CallContext) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = ()> + Send + 'static,
            {
                self.common.on_start = Some(Arc::new(move |ctx| f(ctx).boxed()));
                self
            }

            pub fn on_success<F, Fut>(mut self, f: F) -> Self
            where
                F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = ()> + Send + 'static,
            {
                self.common.on_success = Some(Arc::new(move |ctx, data| f(ctx, data).boxed()));
                self
            }

            pub fn on_error<F, Fut>(mut self, f: F) -> Self
            where
                F: Fn(CallContext, QueryError) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = ()> + Send + 'static,
            {
                self.common.on_error = Some(Arc::new(move |ctx, error| f(ctx, error).boxed()));
                self
            }
        }
    };
}

common_builder_methods!(QueryDefinition);
common_builder_methods!(MutationDefinition);

impl QueryDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provides(mut self, tags: impl Into<TagDescription>) -> Self {
        self.provides = Some(tags.into());
        self
    }
}

impl MutationDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidates(mut self, tags: impl Into<TagDescription>) -> Self {
        self.invalidates = Some(tags.into());
        self
    }
}

/// A registered endpoint.
#[derive(Debug, Clone)]
pub enum EndpointDefinition {
    Query(QueryDefinition),
    Mutation(MutationDefinition),
}

impl EndpointDefinition {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Self::Query(_) => EndpointKind::Query,
            Self::Mutation(_) => EndpointKind::Mutation,
        }
    }

    pub fn common(&self) -> &EndpointCommon {
        match self {
            Self::Query(q) => &q.common,
            Self::Mutation(m) => &m.common,
        }
    }

    /// `provides` for queries, `invalidates` for mutations.
    pub fn tags(&self) -> Option<&TagDescription> {
        match self {
            Self::Query(q) => q.provides.as_ref(),
            Self::Mutation(m) => m.invalidates.as_ref(),
        }
    }
}

impl From<QueryDefinition> for EndpointDefinition {
    fn from(q: QueryDefinition) -> Self {
        Self::Query(q)
    }
}

impl From<MutationDefinition> for EndpointDefinition {
    fn from(m: MutationDefinition) -> Self {
        Self::Mutation(m)
    }
}

/// Endpoint names become the prefix of cache keys, so `(` is reserved.
pub(crate) fn is_valid_endpoint_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('(')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::Tag;

    #[test]
    fn test_kind_discriminant() {
        let query: EndpointDefinition = QueryDefinition::new()
            .request(|_| Value::String("/count".into()))
            .provides(vec!["Counter"])
            .into();
        let mutation: EndpointDefinition = MutationDefinition::new()
            .query_fn(|args, _ctx| async move { Ok(args) })
            .invalidates(vec![Tag::new("Counter")])
            .into();

        assert_eq!(query.kind(), EndpointKind::Query);
        assert_eq!(mutation.kind(), EndpointKind::Mutation);
        assert!(matches!(query.common().fetcher, Some(Fetcher::Request(_))));
        assert!(matches!(mutation.common().fetcher, Some(Fetcher::QueryFn(_))));
        assert!(query.tags().is_some());
    }

    #[test]
    fn test_endpoint_names() {
        assert!(is_valid_endpoint_name("getCount"));
        assert!(!is_valid_endpoint_name(""));
        assert!(!is_valid_endpoint_name("get(Count"));
    }

    #[tokio::test]
    async fn test_abort_signal() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.aborted().await }
        });
        controller.abort();
        waiter.await.unwrap();
        assert!(signal.is_aborted());
        assert!(controller.is_aborted());
    }
}
