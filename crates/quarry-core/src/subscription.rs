//! Subscription registry: consumer reference counts, GC timers and pollers.
//!
//! The registry only does bookkeeping. Timer and poller tasks are spawned by
//! the engine and handed in as `JoinHandle`s so they can be cancelled here.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::key::CacheKey;
use crate::types::Refetch;

/// Handle identifying one consumer's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Per-subscription options. `None` falls back to the engine config.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionOptions {
    /// Do not subscribe or fetch at all.
    pub skip: bool,
    /// Overrides the mount policy for the initiating request.
    pub force_refetch: Option<Refetch>,
    /// Re-issue a forced refetch on this interval while subscribed.
    #[serde(with = "millis")]
    pub polling_interval: Option<Duration>,
    pub refetch_on_mount_or_arg_change: Option<Refetch>,
    pub refetch_on_focus: Option<bool>,
    pub refetch_on_reconnect: Option<bool>,
}

impl SubscriptionOptions {
    pub fn polling(interval: Duration) -> Self {
        Self {
            polling_interval: Some(interval),
            ..Self::default()
        }
    }

    fn effective_polling(&self) -> Option<Duration> {
        self.polling_interval.filter(|d| !d.is_zero())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

struct Poller {
    interval: Duration,
    task: JoinHandle<()>,
}

/// Everything tracked for one cache key.
struct KeySubscriptions {
    endpoint: String,
    args: Value,
    consumers: BTreeMap<SubscriptionId, SubscriptionOptions>,
    gc: Option<JoinHandle<()>>,
    poller: Option<Poller>,
}

impl KeySubscriptions {
    fn new(endpoint: &str, args: &Value) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            args: args.clone(),
            consumers: BTreeMap::new(),
            gc: None,
            poller: None,
        }
    }

    fn cancel_gc(&mut self) -> bool {
        match self.gc.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.task.abort();
        }
    }
}

/// Reference counts and timers per cache key.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: u64,
    by_key: HashMap<CacheKey, KeySubscriptions>,
    owners: HashMap<SubscriptionId, CacheKey>,
}

impl SubscriptionRegistry {
    /// Register a consumer. Any pending GC timer for the key is cancelled.
    pub fn add(
        &mut self,
        key: &CacheKey,
        endpoint: &str,
        args: &Value,
        options: SubscriptionOptions,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);

        let subs = self
            .by_key
            .entry(key.clone())
            .or_insert_with(|| KeySubscriptions::new(endpoint, args));
        subs.cancel_gc();
        subs.consumers.insert(id, options);
        self.owners.insert(id, key.clone());
        id
    }

    /// Drop a consumer; returns its key and the remaining count.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<(CacheKey, usize)> {
        let key = self.owners.remove(&id)?;
        let remaining = match self.by_key.get_mut(&key) {
            Some(subs) => {
                subs.consumers.remove(&id);
                subs.consumers.len()
            }
            None => 0,
        };
        Some((key, remaining))
    }

    /// Replace a consumer's options; returns its key.
    pub fn update(&mut self, id: SubscriptionId, options: SubscriptionOptions) -> Option<CacheKey> {
        let key = self.owners.get(&id)?.clone();
        let slot = self.by_key.get_mut(&key)?.consumers.get_mut(&id)?;
        *slot = options;
        Some(key)
    }

    pub fn key_of(&self, id: SubscriptionId) -> Option<&CacheKey> {
        self.owners.get(&id)
    }

    pub fn options(&self, id: SubscriptionId) -> Option<SubscriptionOptions> {
        let key = self.owners.get(&id)?;
        self.by_key.get(key)?.consumers.get(&id).copied()
    }

    pub fn count(&self, key: &CacheKey) -> usize {
        self.by_key.get(key).map_or(0, |s| s.consumers.len())
    }

    /// Endpoint and arguments the key was first subscribed with.
    pub fn origin(&self, key: &CacheKey) -> Option<(&str, &Value)> {
        self.by_key
            .get(key)
            .map(|s| (s.endpoint.as_str(), &s.args))
    }

    /// Keys with at least one consumer, in key order.
    pub fn subscribed_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self
            .by_key
            .iter()
            .filter(|(_, s)| !s.consumers.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Subscribed keys where any consumer satisfies `pred`.
    pub fn keys_where(&self, pred: impl Fn(&SubscriptionOptions) -> bool) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self
            .by_key
            .iter()
            .filter(|(_, s)| s.consumers.values().any(&pred))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Shortest non-zero polling interval among the key's consumers.
    pub fn polling_interval(&self, key: &CacheKey) -> Option<Duration> {
        self.by_key
            .get(key)?
            .consumers
            .values()
            .filter_map(SubscriptionOptions::effective_polling)
            .min()
    }

    pub fn poller_interval(&self, key: &CacheKey) -> Option<Duration> {
        self.by_key.get(key)?.poller.as_ref().map(|p| p.interval)
    }

    /// Install a poller, replacing (and cancelling) any existing one.
    pub fn set_poller(&mut self, key: &CacheKey, interval: Duration, task: JoinHandle<()>) {
        match self.by_key.get_mut(key) {
            Some(subs) => {
                subs.stop_poller();
                subs.poller = Some(Poller { interval, task });
            }
            None => task.abort(),
        }
    }

    pub fn stop_poller(&mut self, key: &CacheKey) {
        if let Some(subs) = self.by_key.get_mut(key) {
            subs.stop_poller();
        }
    }

    pub fn has_gc(&self, key: &CacheKey) -> bool {
        self.by_key.get(key).is_some_and(|s| s.gc.is_some())
    }

    /// Install a GC timer, replacing (and cancelling) any existing one.
    pub fn schedule_gc(&mut self, key: &CacheKey, endpoint: &str, args: &Value, task: JoinHandle<()>) {
        let subs = self
            .by_key
            .entry(key.clone())
            .or_insert_with(|| KeySubscriptions::new(endpoint, args));
        subs.cancel_gc();
        subs.gc = Some(task);
    }

    /// Drop the key's GC handle without cancelling it. Called from the GC
    /// task when it declines to evict.
    pub fn release_gc(&mut self, key: &CacheKey) {
        if let Some(subs) = self.by_key.get_mut(key) {
            subs.gc = None;
        }
    }

    /// Forget a key with no consumers left. Returns false if it has consumers.
    pub fn forget(&mut self, key: &CacheKey) -> bool {
        if self.count(key) > 0 {
            return false;
        }
        if let Some(mut subs) = self.by_key.remove(key) {
            subs.stop_poller();
            // The caller may be the GC task itself; its handle is just dropped.
            subs.gc = None;
        }
        true
    }

    /// Cancel every GC timer, dropping keys that have no consumers.
    pub fn cancel_all_gc(&mut self) {
        self.by_key.retain(|_, subs| {
            subs.cancel_gc();
            !subs.consumers.is_empty()
        });
    }

    /// Cancel every timer and poller. Consumers stay registered.
    pub fn shutdown(&mut self) {
        for subs in self.by_key.values_mut() {
            subs.cancel_gc();
            subs.stop_poller();
        }
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s)
    }

    #[test]
    fn test_reference_counting() {
        let mut registry = SubscriptionRegistry::default();
        let k = key("getUser(1)");
        let a = registry.add(&k, "getUser", &json!(1), SubscriptionOptions::default());
        let b = registry.add(&k, "getUser", &json!(1), SubscriptionOptions::default());
        assert_ne!(a, b);
        assert_eq!(registry.count(&k), 2);

        assert_eq!(registry.remove(a), Some((k.clone(), 1)));
        assert_eq!(registry.remove(a), None);
        assert_eq!(registry.remove(b), Some((k.clone(), 0)));
        assert_eq!(registry.count(&k), 0);
        assert!(registry.subscribed_keys().is_empty());
    }

    #[test]
    fn test_polling_interval_is_minimum() {
        let mut registry = SubscriptionRegistry::default();
        let k = key("getCount(undefined)");
        registry.add(&k, "getCount", &Value::Null, SubscriptionOptions::polling(Duration::from_secs(30)));
        let fast = registry.add(
            &k,
            "getCount",
            &Value::Null,
            SubscriptionOptions::polling(Duration::from_secs(5)),
        );
        registry.add(&k, "getCount", &Value::Null, SubscriptionOptions::polling(Duration::ZERO));
        assert_eq!(registry.polling_interval(&k), Some(Duration::from_secs(5)));

        registry.remove(fast);
        assert_eq!(registry.polling_interval(&k), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_update_options() {
        let mut registry = SubscriptionRegistry::default();
        let k = key("getCount(undefined)");
        let id = registry.add(&k, "getCount", &Value::Null, SubscriptionOptions::default());
        assert_eq!(registry.polling_interval(&k), None);

        let updated = SubscriptionOptions {
            refetch_on_focus: Some(true),
            ..SubscriptionOptions::polling(Duration::from_secs(1))
        };
        assert_eq!(registry.update(id, updated), Some(k.clone()));
        assert_eq!(registry.options(id), Some(updated));
        assert_eq!(registry.keys_where(|o| o.refetch_on_focus == Some(true)), vec![k]);
    }

    #[tokio::test]
    async fn test_resubscribe_cancels_gc() {
        let mut registry = SubscriptionRegistry::default();
        let k = key("getUser(1)");
        let id = registry.add(&k, "getUser", &json!(1), SubscriptionOptions::default());
        registry.remove(id);

        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let timer = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });
        registry.schedule_gc(&k, "getUser", &json!(1), timer);
        assert!(registry.has_gc(&k));

        registry.add(&k, "getUser", &json!(1), SubscriptionOptions::default());
        assert!(!registry.has_gc(&k));
        // The aborted timer drops its sender.
        assert!(alive_rx.await.is_err());
    }

    #[test]
    fn test_forget_requires_zero_consumers() {
        let mut registry = SubscriptionRegistry::default();
        let k = key("getUser(1)");
        let id = registry.add(&k, "getUser", &json!(1), SubscriptionOptions::default());
        assert!(!registry.forget(&k));
        registry.remove(id);
        assert!(registry.forget(&k));
        assert!(registry.origin(&k).is_none());
    }

    #[test]
    fn test_options_wire_format() {
        let options: SubscriptionOptions =
            serde_json::from_value(json!({"pollingInterval": 1500, "forceRefetch": 10})).unwrap();
        assert_eq!(options.polling_interval, Some(Duration::from_millis(1500)));
        assert_eq!(options.force_refetch, Some(Refetch::IfOlderThan(10.0)));
        assert!(!options.skip);
    }
}
