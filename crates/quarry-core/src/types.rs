//! Data model of the cache: entry statuses, entries and the serializable state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::QueryError;
use crate::key::CacheKey;
use crate::tags::Tag;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    #[default]
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
        })
    }
}

/// Identifier of a single transport invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of one request as handed to waiters.
pub type QueryOutcome = Result<Value, QueryError>;

/// When a cached value should be refetched instead of served.
///
/// Serializes as `false`, `true` or a number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "RefetchRepr", into = "RefetchRepr")]
pub enum Refetch {
    /// Serve the cached value.
    #[default]
    Never,
    /// Always refetch.
    Always,
    /// Refetch once the value is at least this many seconds old.
    IfOlderThan(f64),
}

impl Refetch {
    /// Whether a value fulfilled at `fulfilled_at` should be refetched at `now`.
    pub fn is_due(&self, fulfilled_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::IfOlderThan(secs) => age_secs(fulfilled_at, now) >= *secs,
        }
    }
}

impl From<bool> for Refetch {
    fn from(b: bool) -> Self {
        if b { Self::Always } else { Self::Never }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RefetchRepr {
    Flag(bool),
    Seconds(f64),
}

impl From<RefetchRepr> for Refetch {
    fn from(repr: RefetchRepr) -> Self {
        match repr {
            RefetchRepr::Flag(b) => b.into(),
            RefetchRepr::Seconds(s) => Self::IfOlderThan(s),
        }
    }
}

impl From<Refetch> for RefetchRepr {
    fn from(r: Refetch) -> Self {
        match r {
            Refetch::Never => Self::Flag(false),
            Refetch::Always => Self::Flag(true),
            Refetch::IfOlderThan(s) => Self::Seconds(s),
        }
    }
}

/// Seconds elapsed between two instants, with millisecond precision.
pub fn age_secs(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - then).num_milliseconds() as f64 / 1000.0
}

/// Cached state of one query key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCacheEntry {
    pub endpoint_name: String,
    pub status: QueryStatus,
    pub original_args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
    /// Request whose resolution may commit to this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub provided_tags: Vec<Tag>,
    /// Marked stale by tag invalidation; the next request refetches.
    #[serde(default)]
    pub invalidated: bool,
}

impl QueryCacheEntry {
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }
}

/// State of one mutation invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationCacheEntry {
    pub endpoint_name: String,
    pub status: QueryStatus,
    pub original_args: Value,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<DateTime<Utc>>,
}

/// Host environment flags driven by the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub focused: bool,
    pub online: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            focused: true,
            online: true,
        }
    }
}

/// Everything the engine owns that is observable and serializable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheState {
    pub queries: BTreeMap<CacheKey, QueryCacheEntry>,
    pub mutations: BTreeMap<RequestId, MutationCacheEntry>,
    pub config: EngineConfig,
    #[serde(default)]
    pub environment: Environment,
}
