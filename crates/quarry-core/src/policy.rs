//! Refetch policy: decide whether a request should hit the transport.
//!
//! Everything here is a pure function of the entry, the caller's intent and the
//! current time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{QueryCacheEntry, Refetch};

/// What to do with a request for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDecision {
    /// Issue a new transport call.
    Fetch,
    /// A call is already in flight; wait for it.
    JoinInFlight,
    /// Serve the cached outcome.
    ServeCached,
}

/// The caller's intent for one request.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FetchIntent {
    /// Explicit override; takes precedence over the mount policy.
    pub force_refetch: Option<Refetch>,
    /// The request comes from a subscribing consumer.
    pub subscribe: bool,
    /// Mount policy of the subscription, falling back to the engine config.
    pub refetch_on_mount_or_arg_change: Option<Refetch>,
}

impl FetchIntent {
    pub fn forced() -> Self {
        Self {
            force_refetch: Some(Refetch::Always),
            ..Self::default()
        }
    }

    pub fn subscribing() -> Self {
        Self {
            subscribe: true,
            ..Self::default()
        }
    }

    /// The refetch rule that applies to an already fulfilled entry.
    pub fn effective_refetch(&self, config_refetch: Refetch) -> Refetch {
        match self.force_refetch {
            Some(r) => r,
            None if self.subscribe => self.refetch_on_mount_or_arg_change.unwrap_or(config_refetch),
            None => Refetch::Never,
        }
    }
}

/// Decide whether a request for a key should be fetched.
///
/// A pending entry is never fetched twice, whatever the threshold. An entry
/// marked invalidated is always fetched.
pub fn evaluate(
    entry: Option<&QueryCacheEntry>,
    intent: &FetchIntent,
    config_refetch: Refetch,
    now: DateTime<Utc>,
) -> FetchDecision {
    let Some(entry) = entry else {
        return FetchDecision::Fetch;
    };
    if entry.is_pending() {
        return FetchDecision::JoinInFlight;
    }
    if entry.invalidated {
        return FetchDecision::Fetch;
    }

    match entry.fulfilled_at {
        Some(fulfilled_at) => {
            if intent.effective_refetch(config_refetch).is_due(fulfilled_at, now) {
                FetchDecision::Fetch
            } else {
                FetchDecision::ServeCached
            }
        }
        None => FetchDecision::Fetch,
    }
}

/// Freshness requirement for `prefetch`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrefetchOptions {
    /// Fetch unless cached data exists.
    #[default]
    Default,
    /// Always fetch.
    Force,
    /// Fetch when cached data is at least this many seconds old.
    IfOlderThan(f64),
}

/// Outcome of the prefetch pre-check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrefetchDecision {
    Skip,
    Initiate(Refetch),
}

/// Decide whether a prefetch should initiate a request, and with which
/// forced refetch rule.
pub fn prefetch_decision(
    entry: Option<&QueryCacheEntry>,
    options: PrefetchOptions,
    now: DateTime<Utc>,
) -> PrefetchDecision {
    match options {
        PrefetchOptions::Force => PrefetchDecision::Initiate(Refetch::Always),
        PrefetchOptions::Default => PrefetchDecision::Initiate(Refetch::Never),
        PrefetchOptions::IfOlderThan(secs) => {
            let fulfilled_at = entry.and_then(|e| e.fulfilled_at);
            match fulfilled_at {
                Some(at) if !Refetch::IfOlderThan(secs).is_due(at, now) => PrefetchDecision::Skip,
                _ => PrefetchDecision::Initiate(Refetch::Always),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryStatus;
    use chrono::Duration;
    use serde_json::json;
    use test_case::test_case;

    fn entry(status: QueryStatus, fulfilled_secs_ago: Option<i64>, now: DateTime<Utc>) -> QueryCacheEntry {
        QueryCacheEntry {
            endpoint_name: "getUser".into(),
            status,
            original_args: json!(5),
            data: fulfilled_secs_ago.map(|_| json!({"id": 5})),
            error: None,
            request_id: None,
            started_at: None,
            fulfilled_at: fulfilled_secs_ago.map(|s| now - Duration::seconds(s)),
            provided_tags: Vec::new(),
            invalidated: false,
        }
    }

    #[test]
    fn test_missing_entry_fetches() {
        let now = Utc::now();
        assert_eq!(
            evaluate(None, &FetchIntent::default(), Refetch::Never, now),
            FetchDecision::Fetch
        );
    }

    #[test_case(Some(Refetch::Always) ; "forced")]
    #[test_case(Some(Refetch::IfOlderThan(0.0)) ; "zero threshold")]
    #[test_case(None ; "no override")]
    fn test_pending_always_joins(force: Option<Refetch>) {
        let now = Utc::now();
        let e = entry(QueryStatus::Pending, Some(100), now);
        let intent = FetchIntent {
            force_refetch: force,
            subscribe: true,
            refetch_on_mount_or_arg_change: None,
        };
        assert_eq!(
            evaluate(Some(&e), &intent, Refetch::Always, now),
            FetchDecision::JoinInFlight
        );
    }

    #[test_case(Some(Refetch::Always), 1, FetchDecision::Fetch ; "force true")]
    #[test_case(Some(Refetch::Never), 1000, FetchDecision::ServeCached ; "force false")]
    #[test_case(Some(Refetch::IfOlderThan(10.0)), 9, FetchDecision::ServeCached ; "below threshold")]
    #[test_case(Some(Refetch::IfOlderThan(10.0)), 10, FetchDecision::Fetch ; "at threshold")]
    #[test_case(None, 1000, FetchDecision::ServeCached ; "unsubscribed without override")]
    fn test_fulfilled_entry(force: Option<Refetch>, age: i64, expected: FetchDecision) {
        let now = Utc::now();
        let e = entry(QueryStatus::Fulfilled, Some(age), now);
        let intent = FetchIntent {
            force_refetch: force,
            ..FetchIntent::default()
        };
        assert_eq!(evaluate(Some(&e), &intent, Refetch::Always, now), expected);
    }

    #[test]
    fn test_subscribe_uses_mount_policy() {
        let now = Utc::now();
        let e = entry(QueryStatus::Fulfilled, Some(30), now);

        assert_eq!(
            evaluate(Some(&e), &FetchIntent::subscribing(), Refetch::Never, now),
            FetchDecision::ServeCached
        );
        assert_eq!(
            evaluate(Some(&e), &FetchIntent::subscribing(), Refetch::IfOlderThan(20.0), now),
            FetchDecision::Fetch
        );

        let intent = FetchIntent {
            subscribe: true,
            refetch_on_mount_or_arg_change: Some(Refetch::Never),
            ..FetchIntent::default()
        };
        assert_eq!(
            evaluate(Some(&e), &intent, Refetch::Always, now),
            FetchDecision::ServeCached
        );
    }

    #[test]
    fn test_rejected_without_data_fetches() {
        let now = Utc::now();
        let e = entry(QueryStatus::Rejected, None, now);
        assert_eq!(
            evaluate(Some(&e), &FetchIntent::default(), Refetch::Never, now),
            FetchDecision::Fetch
        );
    }

    #[test]
    fn test_invalidated_fetches() {
        let now = Utc::now();
        let mut e = entry(QueryStatus::Fulfilled, Some(1), now);
        e.invalidated = true;
        assert_eq!(
            evaluate(Some(&e), &FetchIntent::default(), Refetch::Never, now),
            FetchDecision::Fetch
        );
    }

    #[test]
    fn test_prefetch_if_older_than() {
        let now = Utc::now();
        let options = PrefetchOptions::IfOlderThan(10.0);

        assert_eq!(
            prefetch_decision(None, options, now),
            PrefetchDecision::Initiate(Refetch::Always)
        );
        let fresh = entry(QueryStatus::Fulfilled, Some(3), now);
        assert_eq!(prefetch_decision(Some(&fresh), options, now), PrefetchDecision::Skip);
        let stale = entry(QueryStatus::Fulfilled, Some(15), now);
        assert_eq!(
            prefetch_decision(Some(&stale), options, now),
            PrefetchDecision::Initiate(Refetch::Always)
        );
    }

    #[test]
    fn test_prefetch_force_and_default() {
        let now = Utc::now();
        let fresh = entry(QueryStatus::Fulfilled, Some(3), now);
        assert_eq!(
            prefetch_decision(Some(&fresh), PrefetchOptions::Force, now),
            PrefetchDecision::Initiate(Refetch::Always)
        );
        assert_eq!(
            prefetch_decision(Some(&fresh), PrefetchOptions::Default, now),
            PrefetchDecision::Initiate(Refetch::Never)
        );
    }
}
