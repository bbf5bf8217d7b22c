//! Vector-clock algebra: per-client counters with merge, increment,
//! causal comparison, and bounded pruning.
//!
//! Clocks are small (bounded by pruning) so they are stored owned and
//! copied on update. Missing keys compare as counter 0.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    /// Self causally precedes other.
    Less,
    /// Self causally dominates other.
    Greater,
    /// Neither dominates: concurrent edits.
    Concurrent,
}

/// A mapping from client id to a monotonically increasing counter.
///
/// Backed by a `BTreeMap` so iteration order (and therefore pruning
/// tie-breaks and serialized form) is deterministic across clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock with a single entry.
    pub fn single(client_id: impl Into<String>, counter: u64) -> Self {
        let mut counters = BTreeMap::new();
        counters.insert(client_id.into(), counter);
        Self { counters }
    }

    /// Counter for a client; missing keys read as 0.
    pub fn get(&self, client_id: &str) -> u64 {
        self.counters.get(client_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, client_id: impl Into<String>, counter: u64) {
        self.counters.insert(client_id.into(), counter);
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.counters.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.counters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Bump the counter for a client by one.
    pub fn increment(&mut self, client_id: &str) {
        *self.counters.entry(client_id.to_string()).or_insert(0) += 1;
    }

    /// Componentwise max with another clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client, &counter) in &other.counters {
            let entry = self.counters.entry(client.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Fold-merge any number of clocks and then increment `client_id`.
    ///
    /// The result is strictly `Greater` than every input.
    pub fn merge_and_increment<'a, I>(clocks: I, client_id: &str) -> VectorClock
    where
        I: IntoIterator<Item = &'a VectorClock>,
    {
        let mut merged = VectorClock::new();
        for clock in clocks {
            merged.merge(clock);
        }
        merged.increment(client_id);
        merged
    }

    /// Causal comparison over the union of keys, missing keys as 0.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut has_less = false;
        let mut has_greater = false;

        for client in self.counters.keys().chain(other.counters.keys()) {
            let a = self.get(client);
            let b = other.get(client);
            if a < b {
                has_less = true;
            } else if a > b {
                has_greater = true;
            }
            if has_less && has_greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (has_less, has_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Less,
            (false, true) => ClockOrdering::Greater,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Prune down to at most `limit` entries.
    ///
    /// `local_client_id` and every id in `protected` are always kept (when
    /// present in the clock); if the mandatory set alone exceeds the limit
    /// it is kept whole. Remaining slots go to the highest counters, ties
    /// broken by lexicographic key order.
    ///
    /// Pruning is lossy: two pruned clocks may compare `Concurrent` where
    /// the unpruned ones would not. See the pruning-artifact heuristic in
    /// the sync-import filter.
    pub fn limit_size(
        &self,
        limit: usize,
        protected: &BTreeSet<String>,
        local_client_id: &str,
    ) -> VectorClock {
        if self.counters.len() <= limit {
            return self.clone();
        }

        let mandatory: BTreeSet<&str> = self
            .counters
            .keys()
            .map(String::as_str)
            .filter(|k| *k == local_client_id || protected.contains(*k))
            .collect();

        let mut kept: BTreeMap<String, u64> = self
            .counters
            .iter()
            .filter(|(k, _)| mandatory.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        if kept.len() < limit {
            let mut rest: Vec<(&String, u64)> = self
                .counters
                .iter()
                .filter(|(k, _)| !mandatory.contains(k.as_str()))
                .map(|(k, v)| (k, *v))
                .collect();
            // Highest counter first; lexicographic key order on ties.
            rest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            for (key, counter) in rest.into_iter().take(limit - kept.len()) {
                kept.insert(key.clone(), counter);
            }
        }

        VectorClock { counters: kept }
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn compare_equal() {
        let a = clock(&[("a", 1), ("b", 2)]);
        let b = clock(&[("b", 2), ("a", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Equal);
    }

    #[test]
    fn compare_equal_modulo_missing_as_zero() {
        let a = clock(&[("a", 1), ("b", 0)]);
        let b = clock(&[("a", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Equal);
        assert_eq!(b.compare(&a), ClockOrdering::Equal);
    }

    #[test]
    fn compare_less_and_greater() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 2), ("b", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Less);
        assert_eq!(b.compare(&a), ClockOrdering::Greater);
    }

    #[test]
    fn compare_concurrent() {
        let a = clock(&[("a", 2), ("b", 1)]);
        let b = clock(&[("a", 1), ("b", 2)]);
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
    }

    #[test]
    fn merge_is_componentwise_max() {
        let mut a = clock(&[("a", 3), ("b", 1)]);
        a.merge(&clock(&[("b", 4), ("c", 2)]));
        assert_eq!(a, clock(&[("a", 3), ("b", 4), ("c", 2)]));
    }

    #[test]
    fn merge_and_increment_dominates_every_input() {
        let inputs = vec![
            clock(&[("a", 5)]),
            clock(&[("b", 7)]),
            clock(&[("a", 2), ("c", 9)]),
        ];
        let merged = VectorClock::merge_and_increment(inputs.iter(), "a");
        for input in &inputs {
            assert_eq!(merged.compare(input), ClockOrdering::Greater);
        }
        assert_eq!(merged.get("a"), 6);
    }

    #[test]
    fn increment_of_empty_merge_equals_plain_increment() {
        let x = clock(&[("a", 3), ("b", 1)]);
        let via_merge = VectorClock::merge_and_increment([&x], "c");
        let mut plain = x.clone();
        plain.increment("c");
        assert_eq!(via_merge, plain);
    }

    #[test]
    fn limit_size_noop_when_under_limit() {
        let a = clock(&[("a", 1), ("b", 2)]);
        assert_eq!(a.limit_size(5, &BTreeSet::new(), "a"), a);
    }

    #[test]
    fn limit_size_keeps_local_and_protected() {
        let a = clock(&[("a", 1), ("b", 100), ("c", 50), ("d", 40), ("e", 30)]);
        let protected: BTreeSet<String> = ["e".to_string()].into();
        let pruned = a.limit_size(3, &protected, "a");
        assert_eq!(pruned.len(), 3);
        // Lowest counters, but mandatory.
        assert!(pruned.contains("a"));
        assert!(pruned.contains("e"));
        // One slot left goes to the highest remaining counter.
        assert!(pruned.contains("b"));
        assert_eq!(pruned.get("b"), 100);
    }

    #[test]
    fn limit_size_mandatory_set_may_exceed_limit() {
        let a = clock(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
        let protected: BTreeSet<String> =
            ["b".to_string(), "c".to_string(), "d".to_string()].into();
        let pruned = a.limit_size(2, &protected, "a");
        // All four are mandatory; the size invariant is relaxed.
        assert_eq!(pruned.len(), 4);
    }

    #[test]
    fn limit_size_breaks_counter_ties_lexicographically() {
        let a = clock(&[("z", 10), ("y", 10), ("x", 10), ("local", 1)]);
        let pruned = a.limit_size(3, &BTreeSet::new(), "local");
        assert!(pruned.contains("local"));
        assert!(pruned.contains("x"));
        assert!(pruned.contains("y"));
        assert!(!pruned.contains("z"));
    }

    #[test]
    fn limit_size_preserves_counters() {
        let a = clock(&[("a", 7), ("b", 9), ("c", 3)]);
        let pruned = a.limit_size(2, &BTreeSet::new(), "a");
        assert_eq!(pruned.get("a"), 7);
        assert_eq!(pruned.get("b"), 9);
        assert!(!pruned.contains("c"));
    }

    #[test]
    fn pruning_can_introduce_false_concurrency() {
        // A post-import clock that strictly dominated the import clock may
        // compare Concurrent after pruning drops one of the import keys.
        let import = clock(&[("c0", 10), ("c1", 10)]);
        let mut post = import.clone();
        post.increment("new");
        assert_eq!(post.compare(&import), ClockOrdering::Greater);

        let pruned = post.limit_size(2, &BTreeSet::new(), "new");
        assert_eq!(pruned.compare(&import), ClockOrdering::Concurrent);
    }

    #[test]
    fn serde_round_trip_is_a_plain_map() {
        let a = clock(&[("a", 1), ("b", 2)]);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, r#"{"a":1,"b":2}"#);
        let back: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}
