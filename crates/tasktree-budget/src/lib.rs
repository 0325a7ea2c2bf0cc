//! Named cache budgets.
//!
//! A `BudgetManager` does not own any cached data. Callers keep their own
//! `HashMap`s and report gets/sets/evictions to the manager under a cache
//! name; `apply` then trims the caller's map back under the configured entry
//! count (least recently touched first) after dropping entries older than the
//! optional max age.
//!
//! Unregistered names are ignored everywhere. The manager is telemetry
//! infrastructure and never fails from a hot path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ENTRIES: usize = 500;

static GLOBAL_BUDGET: Lazy<Arc<BudgetManager>> = Lazy::new(|| Arc::new(BudgetManager::new()));

/// Process-wide manager shared by subsystems that namespace their cache names.
pub fn global_budget() -> Arc<BudgetManager> {
    GLOBAL_BUDGET.clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Lru,
    Ttl,
}

impl EvictionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionReason::Lru => "lru",
            EvictionReason::Ttl => "ttl",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetTelemetry {
    pub size: usize,
    pub max_entries: usize,
    pub evictions: u64,
    pub ttl_expired: u64,
    /// Same value as `ttl_expired`.
    pub ttl_evictions: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Touch {
    at_ms: u64,
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheBudget {
    max_entries: usize,
    max_age_ms: Option<u64>,
    touched: HashMap<String, Touch>,
    size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    ttl_expired: u64,
}

impl CacheBudget {
    fn telemetry(&self) -> BudgetTelemetry {
        let requests = self.hits + self.misses;
        let hit_rate = if requests == 0 {
            0.0
        } else {
            self.hits as f64 / requests as f64
        };
        BudgetTelemetry {
            size: self.size,
            max_entries: self.max_entries,
            evictions: self.evictions,
            ttl_expired: self.ttl_expired,
            ttl_evictions: self.ttl_expired,
            hit_rate,
        }
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    caches: HashMap<String, CacheBudget>,
    seq: u64,
}

impl BudgetState {
    fn touch(&mut self, name: &str, key: &str) {
        self.seq = self.seq.wrapping_add(1);
        let touch = Touch {
            at_ms: now_ms(),
            seq: self.seq,
        };
        if let Some(cache) = self.caches.get_mut(name) {
            cache.touched.insert(key.to_string(), touch);
        }
    }
}

/// Eviction policy and counters for any number of named caches.
#[derive(Debug, Default)]
pub struct BudgetManager {
    state: Mutex<BudgetState>,
}

impl BudgetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or reconfigure a named cache. Counters survive re-registration.
    pub fn register(&self, name: &str, max_entries: Option<usize>, max_age_ms: Option<u64>) {
        let max_entries = sanitize_max_entries(max_entries);
        let max_age_ms = max_age_ms.filter(|age| *age > 0);
        let mut state = self.state.lock();
        let cache = state.caches.entry(name.to_string()).or_default();
        cache.max_entries = max_entries;
        cache.max_age_ms = max_age_ms;
        tracing::debug!(cache = name, max_entries, ?max_age_ms, "cache budget registered");
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.state.lock().caches.contains_key(name)
    }

    pub fn note_get(&self, name: &str, key: &str, hit: bool) {
        let mut state = self.state.lock();
        let Some(cache) = state.caches.get_mut(name) else {
            return;
        };
        if hit {
            cache.hits += 1;
            state.touch(name, key);
        } else {
            cache.misses += 1;
        }
    }

    pub fn note_set(&self, name: &str, key: &str) {
        self.state.lock().touch(name, key);
    }

    /// Drop the touch record for a key the caller removed on its own.
    pub fn forget(&self, name: &str, key: &str) {
        if let Some(cache) = self.state.lock().caches.get_mut(name) {
            cache.touched.remove(key);
        }
    }

    /// Record a size measured by the caller when the tracked quantity is not
    /// the map passed to `apply`.
    pub fn set_size(&self, name: &str, size: usize) {
        if let Some(cache) = self.state.lock().caches.get_mut(name) {
            cache.size = size;
        }
    }

    pub fn note_eviction(&self, name: &str, count: u64, reason: EvictionReason) {
        let count = count.max(1);
        if let Some(cache) = self.state.lock().caches.get_mut(name) {
            match reason {
                EvictionReason::Lru => cache.evictions += count,
                EvictionReason::Ttl => cache.ttl_expired += count,
            }
        }
    }

    /// Trim `cache` to the configured entry count, least recently touched first.
    /// Returns the evicted keys.
    pub fn apply<V>(&self, name: &str, cache: &mut HashMap<String, V>) -> Vec<String> {
        self.enforce(name, cache, None::<fn(&V) -> Option<u64>>)
    }

    /// Like `apply`, but first removes entries older than the configured max
    /// age according to `created_at_ms`.
    pub fn apply_with_age<V, F>(
        &self,
        name: &str,
        cache: &mut HashMap<String, V>,
        created_at_ms: F,
    ) -> Vec<String>
    where
        F: Fn(&V) -> Option<u64>,
    {
        self.enforce(name, cache, Some(created_at_ms))
    }

    fn enforce<V, F>(
        &self,
        name: &str,
        cache: &mut HashMap<String, V>,
        created_at_ms: Option<F>,
    ) -> Vec<String>
    where
        F: Fn(&V) -> Option<u64>,
    {
        let mut state = self.state.lock();
        let Some(budget) = state.caches.get_mut(name) else {
            return Vec::new();
        };
        let mut evicted = Vec::new();

        if let (Some(max_age_ms), Some(created_at_ms)) = (budget.max_age_ms, created_at_ms) {
            let now = now_ms();
            let expired: Vec<String> = cache
                .iter()
                .filter(|(_, value)| {
                    created_at_ms(value)
                        .is_some_and(|created| now.saturating_sub(created) > max_age_ms)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                cache.remove(&key);
                budget.touched.remove(&key);
                budget.ttl_expired += 1;
                evicted.push(key);
            }
        }

        budget.touched.retain(|key, _| cache.contains_key(key));

        if cache.len() > budget.max_entries {
            let overflow = cache.len() - budget.max_entries;
            let mut order: Vec<(Option<Touch>, String)> = cache
                .keys()
                .map(|key| (budget.touched.get(key).copied(), key.clone()))
                .collect();
            order.sort();
            for (_, key) in order.into_iter().take(overflow) {
                cache.remove(&key);
                budget.touched.remove(&key);
                budget.evictions += 1;
                evicted.push(key);
            }
        }

        budget.size = cache.len();
        if !evicted.is_empty() {
            tracing::debug!(cache = name, evicted = evicted.len(), "cache budget applied");
        }
        evicted
    }

    pub fn telemetry_for(&self, name: &str) -> Option<BudgetTelemetry> {
        self.state.lock().caches.get(name).map(CacheBudget::telemetry)
    }

    pub fn get_telemetry(&self) -> BTreeMap<String, BudgetTelemetry> {
        self.state
            .lock()
            .caches
            .iter()
            .map(|(name, cache)| (name.clone(), cache.telemetry()))
            .collect()
    }
}

/// Missing or zero limits fall back to the default; any positive limit is kept.
fn sanitize_max_entries(value: Option<usize>) -> usize {
    match value {
        Some(n) if n > 0 => n,
        _ => DEFAULT_MAX_ENTRIES,
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(keys: &[&str]) -> HashMap<String, u64> {
        keys.iter().map(|k| (k.to_string(), 0)).collect()
    }

    #[test]
    fn register_keeps_positive_and_defaults_missing_max_entries() {
        let budget = BudgetManager::new();
        budget.register("single", Some(1), None);
        budget.register("small", Some(3), None);
        budget.register("unset", None, None);
        budget.register("zero", Some(0), None);
        assert_eq!(budget.telemetry_for("single").unwrap().max_entries, 1);
        assert_eq!(budget.telemetry_for("small").unwrap().max_entries, 3);
        assert_eq!(budget.telemetry_for("unset").unwrap().max_entries, 500);
        assert_eq!(budget.telemetry_for("zero").unwrap().max_entries, 500);
    }

    #[test]
    fn reregister_keeps_counters() {
        let budget = BudgetManager::new();
        budget.register("c", Some(50), None);
        budget.note_get("c", "a", false);
        budget.note_eviction("c", 2, EvictionReason::Lru);
        budget.register("c", Some(80), Some(1_000));
        let telemetry = budget.telemetry_for("c").unwrap();
        assert_eq!(telemetry.max_entries, 80);
        assert_eq!(telemetry.evictions, 2);
        assert_eq!(telemetry.hit_rate, 0.0);
    }

    #[test]
    fn apply_trims_to_max_entries_oldest_first() {
        let budget = BudgetManager::new();
        budget.register("three", Some(3), None);
        for key in ["a", "b", "c", "d", "e"] {
            budget.note_set("three", key);
        }
        let mut cache = filled(&["a", "b", "c", "d", "e"]);
        let mut evicted = budget.apply("three", &mut cache);
        evicted.sort();
        assert_eq!(evicted, vec!["a".to_string(), "b".to_string()]);
        let telemetry = budget.telemetry_for("three").unwrap();
        assert_eq!(telemetry.evictions, 2);
        assert_eq!(telemetry.size, 3);
    }

    #[test]
    fn apply_evicts_least_recently_touched() {
        let budget = BudgetManager::new();
        budget.register("lru", Some(10), None);
        let keys: Vec<String> = (0..12).map(|i| format!("k{i}")).collect();
        for key in &keys {
            budget.note_set("lru", key);
        }
        // k0 becomes the most recent entry
        budget.note_get("lru", "k0", true);

        let mut cache: HashMap<String, u64> = keys.iter().map(|k| (k.clone(), 0)).collect();
        let mut evicted = budget.apply("lru", &mut cache);
        evicted.sort();
        assert_eq!(evicted, vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(cache.len(), 10);
        assert!(cache.contains_key("k0"));

        let telemetry = budget.telemetry_for("lru").unwrap();
        assert_eq!(telemetry.evictions, 2);
        assert_eq!(telemetry.size, 10);
    }

    #[test]
    fn untouched_keys_are_evicted_first() {
        let budget = BudgetManager::new();
        budget.register("mixed", Some(10), None);
        let keys: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
        for key in &keys {
            budget.note_set("mixed", key);
        }
        let mut cache: HashMap<String, u64> = keys.iter().map(|k| (k.clone(), 0)).collect();
        cache.insert("stray".to_string(), 0);
        let evicted = budget.apply("mixed", &mut cache);
        assert_eq!(evicted, vec!["stray".to_string()]);
    }

    #[test]
    fn apply_under_budget_is_noop() {
        let budget = BudgetManager::new();
        budget.register("roomy", Some(100), None);
        let mut cache = filled(&["a", "b"]);
        assert!(budget.apply("roomy", &mut cache).is_empty());
        assert_eq!(cache.len(), 2);
        assert_eq!(budget.telemetry_for("roomy").unwrap().evictions, 0);
    }

    #[test]
    fn apply_with_age_drops_expired_entries_first() {
        let budget = BudgetManager::new();
        budget.register("ttl", Some(10), Some(60_000));
        let now = now_ms();
        let mut cache: HashMap<String, u64> = HashMap::new();
        cache.insert("stale".to_string(), now - 120_000);
        cache.insert("fresh".to_string(), now);
        let evicted = budget.apply_with_age("ttl", &mut cache, |created| Some(*created));
        assert_eq!(evicted, vec!["stale".to_string()]);
        let telemetry = budget.telemetry_for("ttl").unwrap();
        assert_eq!(telemetry.ttl_expired, 1);
        assert_eq!(telemetry.ttl_evictions, 1);
        assert_eq!(telemetry.evictions, 0);
        assert_eq!(telemetry.size, 1);
    }

    #[test]
    fn age_is_ignored_without_max_age() {
        let budget = BudgetManager::new();
        budget.register("no_ttl", Some(10), None);
        let mut cache: HashMap<String, u64> = HashMap::new();
        cache.insert("ancient".to_string(), 0);
        assert!(budget
            .apply_with_age("no_ttl", &mut cache, |created| Some(*created))
            .is_empty());
    }

    #[test]
    fn hit_rate_counts_hits_over_requests() {
        let budget = BudgetManager::new();
        budget.register("rate", None, None);
        budget.note_get("rate", "a", true);
        budget.note_get("rate", "a", true);
        budget.note_get("rate", "b", true);
        budget.note_get("rate", "c", false);
        assert_eq!(budget.telemetry_for("rate").unwrap().hit_rate, 0.75);
    }

    #[test]
    fn unregistered_names_are_ignored() {
        let budget = BudgetManager::new();
        budget.note_get("ghost", "a", true);
        budget.note_set("ghost", "a");
        budget.set_size("ghost", 4);
        budget.note_eviction("ghost", 1, EvictionReason::Ttl);
        let mut cache = filled(&["a"]);
        assert!(budget.apply("ghost", &mut cache).is_empty());
        assert!(budget.get_telemetry().is_empty());
    }

    #[test]
    fn set_size_and_eviction_counts_surface_in_telemetry() {
        let budget = BudgetManager::new();
        budget.register("queue", Some(20), None);
        budget.set_size("queue", 7);
        budget.note_eviction("queue", 0, EvictionReason::Lru);
        budget.note_eviction("queue", 3, EvictionReason::Ttl);
        let all = budget.get_telemetry();
        let telemetry = all.get("queue").unwrap();
        assert_eq!(telemetry.size, 7);
        assert_eq!(telemetry.evictions, 1);
        assert_eq!(telemetry.ttl_expired, 3);
    }

    #[test]
    fn global_budget_is_shared() {
        global_budget().register("tests.global_budget", Some(5), None);
        assert!(global_budget().is_registered("tests.global_budget"));
    }

    #[test]
    fn telemetry_serializes_with_snake_case_fields() {
        let budget = BudgetManager::new();
        budget.register("wire", Some(10), None);
        let value = serde_json::to_value(budget.telemetry_for("wire").unwrap()).unwrap();
        assert_eq!(value["max_entries"], 10);
        assert_eq!(value["ttl_evictions"], 0);
    }
}
