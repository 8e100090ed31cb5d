//! Reconciliation primitives.
//!
//! Helpers for deriving a consistent view from two independently recorded
//! sources of truth after a restart:
//!
//! - **Declared state**: what was intended (e.g. routes written to disk).
//! - **Observed state**: what is actually alive on the host right now.
//!
//! # Invariants
//!
//! - Functions here perform no I/O
//! - Decisions are deterministic given the same inputs
//! - Applying a reconciliation result and reconciling again yields no stale
//!   entries (idempotence)

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// A declared entry whose backing runtime was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched<K, D, O> {
    pub key: K,
    pub declared: D,
    pub observed: O,
}

/// Outcome of reconciling declared entries against observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation<K, D, O> {
    /// Declared and alive. Ordered by key.
    pub matched: Vec<Matched<K, D, O>>,

    /// Declared but not alive. Ordered by key.
    pub stale: Vec<(K, D)>,

    /// Alive but never declared, or a second observation for a key that was
    /// already matched. Never adopted.
    pub unmanaged: Vec<O>,
}

/// Partition `declared` and `observed` by key.
///
/// `key_of` returns `None` for observations that carry no recognisable key;
/// those are reported as unmanaged. When several observations share a key,
/// the first in iteration order is matched and the rest are unmanaged, so
/// callers that need order independence should sort observations first.
pub fn reconcile<K, D, O, I, F>(
    declared: BTreeMap<K, D>,
    observed: I,
    key_of: F,
) -> Reconciliation<K, D, O>
where
    K: Ord + Clone,
    I: IntoIterator<Item = O>,
    F: Fn(&O) -> Option<K>,
{
    let mut alive: BTreeMap<K, O> = BTreeMap::new();
    let mut unmanaged = Vec::new();

    for item in observed {
        match key_of(&item) {
            Some(key) if declared.contains_key(&key) && !alive.contains_key(&key) => {
                alive.insert(key, item);
            }
            _ => unmanaged.push(item),
        }
    }

    let mut matched = Vec::new();
    let mut stale = Vec::new();

    for (key, declared) in declared {
        match alive.remove(&key) {
            Some(observed) => matched.push(Matched {
                key,
                declared,
                observed,
            }),
            None => stale.push((key, declared)),
        }
    }

    Reconciliation {
        matched,
        stale,
        unmanaged,
    }
}

/// Content fingerprint used to detect whether a regenerated artifact
/// actually changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn declared(keys: &[u32]) -> BTreeMap<u32, String> {
        keys.iter().map(|k| (*k, format!("route-{k}"))).collect()
    }

    #[test]
    fn test_partitions_matched_stale_unmanaged() {
        let result = reconcile(declared(&[1, 2]), vec![1u32, 3], |o| Some(*o));

        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.matched[0].key, 1);
        assert_eq!(result.matched[0].declared, "route-1");
        assert_eq!(result.stale, vec![(2, "route-2".to_string())]);
        assert_eq!(result.unmanaged, vec![3]);
    }

    #[test]
    fn test_unkeyed_observations_are_unmanaged() {
        let result = reconcile(declared(&[1]), vec![None, Some(1u32)], |o| *o);

        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.unmanaged, vec![None]);
    }

    #[test]
    fn test_duplicate_observation_first_wins() {
        let observed = vec![(1u32, "a"), (1, "b")];
        let result = reconcile(declared(&[1]), observed, |o| Some(o.0));

        assert_eq!(result.matched[0].observed, (1, "a"));
        assert_eq!(result.unmanaged, vec![(1, "b")]);
    }

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(ContentHash::of_bytes(b"abc"), ContentHash::of_bytes(b"abc"));
        assert_ne!(ContentHash::of_bytes(b"abc"), ContentHash::of_bytes(b"abd"));
        assert!(ContentHash::of_bytes(b"").as_str().starts_with("sha256:"));
    }

    proptest! {
        #[test]
        fn reconciling_the_pruned_set_is_idempotent(
            decl in proptest::collection::btree_set(0u32..50, 0..20),
            obs in proptest::collection::vec(0u32..60, 0..30),
        ) {
            let first = reconcile(declared(&decl.iter().copied().collect::<Vec<_>>()), obs.clone(), |o| Some(*o));
            let pruned: BTreeMap<u32, String> = first
                .matched
                .iter()
                .map(|m| (m.key, m.declared.clone()))
                .collect();

            let second = reconcile(pruned, obs, |o| Some(*o));
            prop_assert!(second.stale.is_empty());
            prop_assert_eq!(
                second.matched.iter().map(|m| m.key).collect::<Vec<_>>(),
                first.matched.iter().map(|m| m.key).collect::<Vec<_>>()
            );
            prop_assert_eq!(second.unmanaged, first.unmanaged);
        }
    }
}
