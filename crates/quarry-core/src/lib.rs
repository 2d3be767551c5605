//! Client-side data fetching and caching engine.
//!
//! Describe remote reads (queries) and writes (mutations) as endpoints; the
//! engine then:
//! - Deduplicates in-flight requests per cache key
//! - Caches results keyed by endpoint and arguments
//! - Reference-counts subscribers and evicts unused entries after a delay
//! - Invalidates and refetches tagged entries when mutations complete
//! - Applies optimistic updates with undoable structural patches
//!
//! ## Features
//!
//! - **http** (default): `FetchBaseQuery`, a reqwest-backed transport

pub mod clock;
mod config;
pub mod endpoint;
mod engine;
mod error;
mod handle;
#[cfg(feature = "http")]
pub mod http;
pub mod key;
mod lifecycle;
pub mod listeners;
pub mod module;
pub mod patch;
pub mod policy;
mod store;
pub mod subscription;
pub mod tags;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DEFAULT_KEEP_UNUSED_DATA_FOR_SECS, EngineConfig, EngineConfigBuilder};
pub use endpoint::{
    AbortController, AbortSignal, BaseQuery, CallContext, EndpointDefinition, EndpointKind, MutationDefinition,
    QueryDefinition, RequestContext, TransportResult, base_query_fn,
};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, PatchError, QueryError};
pub use handle::{MutationHandle, MutationOptions, QueryHandle};
#[cfg(feature = "http")]
pub use http::FetchBaseQuery;
pub use key::{CacheKey, KeyCodec, default_serialize_query_args};
pub use listeners::{EnvironmentEvent, EventBus};
pub use module::{EventCounter, Module, TracingModule};
pub use patch::{Patch, PatchCollection, PathSegment};
pub use policy::PrefetchOptions;
pub use store::CacheEvent;
pub use subscription::{SubscriptionId, SubscriptionOptions};
pub use tags::{Tag, TagContext, TagDescription};
pub use types::*;
