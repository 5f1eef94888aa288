//! Authoritative in-memory key/value state with per-key versions.
//!
//! Every accepted write bumps the key's version by exactly one. An absent
//! key reports version 0, so `expected_version = Some(0)` means
//! "create only if nobody has written this key yet".
//!
//! All access goes through one `RwLock`. Write hold times are a map lookup
//! plus an insert; nothing awaits while the lock is held.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

/// A value together with the version it was committed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
}

/// Read-only copy of (part of) the hub state at one point in time.
///
/// Ordered so that encoded snapshots are stable.
pub type Snapshot = BTreeMap<String, VersionedValue>;

/// Rejected writes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("version conflict on '{key}': expected {expected}, current is {current_version}")]
    VersionConflict {
        key: String,
        expected: u64,
        current_value: Value,
        current_version: u64,
    },
}

/// The shared state store.
#[derive(Debug, Default)]
pub struct StateStore {
    entries: RwLock<HashMap<String, VersionedValue>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value and version of `key`, if it was ever written.
    pub async fn read(&self, key: &str) -> Option<VersionedValue> {
        self.entries.read().await.get(key).cloned()
    }

    /// Current version of `key` (0 when absent).
    pub async fn version(&self, key: &str) -> u64 {
        self.entries.read().await.get(key).map_or(0, |e| e.version)
    }

    /// Consistent copy of the whole state.
    pub async fn read_all(&self) -> Snapshot {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Consistent copy of the listed keys. Keys never written are omitted.
    pub async fn read_keys(&self, keys: &[String]) -> Snapshot {
        let entries = self.entries.read().await;
        keys.iter()
            .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Commit a write and return the new version.
    ///
    /// With `expected = Some(v)` the write only succeeds when the key is
    /// currently at version `v`; otherwise the store is left untouched and
    /// the current truth is returned in the error.
    pub async fn write(
        &self,
        key: &str,
        value: Value,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key);
        let current_version = current.map_or(0, |e| e.version);

        if let Some(expected) = expected {
            if expected != current_version {
                return Err(StoreError::VersionConflict {
                    key: key.to_string(),
                    expected,
                    current_value: current.map_or(Value::Null, |e| e.value.clone()),
                    current_version,
                });
            }
        }

        let version = current_version + 1;
        entries.insert(key.to_string(), VersionedValue { value, version });
        Ok(version)
    }

    /// Number of keys ever written.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_write_is_version_one() {
        let store = StateStore::new();
        assert_eq!(store.version("x").await, 0);

        let v = store.write("x", json!(1), None).await.unwrap();
        assert_eq!(v, 1);

        let entry = store.read("x").await.unwrap();
        assert_eq!(entry.value, json!(1));
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_unconditional_writes_increment() {
        let store = StateStore::new();
        for i in 1..=5u64 {
            let v = store.write("speed", json!(i * 10), None).await.unwrap();
            assert_eq!(v, i);
        }
        assert_eq!(store.read("speed").await.unwrap().value, json!(50));
    }

    #[tokio::test]
    async fn test_versions_are_per_key() {
        let store = StateStore::new();
        store.write("a", json!("one"), None).await.unwrap();
        store.write("a", json!("two"), None).await.unwrap();
        let b = store.write("b", json!(true), None).await.unwrap();

        assert_eq!(b, 1);
        assert_eq!(store.version("a").await, 2);
    }

    #[tokio::test]
    async fn test_expected_version_match_succeeds() {
        let store = StateStore::new();
        store.write("x", json!(1), None).await.unwrap();

        let v = store.write("x", json!(2), Some(1)).await.unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn test_expected_version_mismatch_leaves_store_unchanged() {
        let store = StateStore::new();
        store.write("x", json!(1), None).await.unwrap();

        let err = store.write("x", json!(2), Some(5)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                key: "x".into(),
                expected: 5,
                current_value: json!(1),
                current_version: 1,
            }
        );

        let entry = store.read("x").await.unwrap();
        assert_eq!(entry.value, json!(1));
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_expected_zero_creates_only_once() {
        let store = StateStore::new();
        assert_eq!(store.write("lock", json!("a"), Some(0)).await.unwrap(), 1);

        let err = store.write("lock", json!("b"), Some(0)).await.unwrap_err();
        match err {
            StoreError::VersionConflict { current_version, current_value, .. } => {
                assert_eq!(current_version, 1);
                assert_eq!(current_value, json!("a"));
            }
        }
    }

    #[tokio::test]
    async fn test_conflict_on_absent_key_reports_null() {
        let store = StateStore::new();
        let err = store.write("ghost", json!(1), Some(3)).await.unwrap_err();
        match err {
            StoreError::VersionConflict { current_version, current_value, .. } => {
                assert_eq!(current_version, 0);
                assert_eq!(current_value, Value::Null);
            }
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_conditional_writers_one_wins() {
        let store = Arc::new(StateStore::new());
        store.write("x", json!(0), None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write("x", json!(i), Some(1)).await
            }));
        }

        let mut winners = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(v) => {
                    assert_eq!(v, 2);
                    winners += 1;
                }
                Err(StoreError::VersionConflict { current_version, .. }) => {
                    assert_eq!(current_version, 2);
                }
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.version("x").await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_unconditional_writers_never_reuse_versions() {
        let store = Arc::new(StateStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write("counter", json!(i), None).await.unwrap()
            }));
        }

        let mut versions = Vec::new();
        for h in handles {
            versions.push(h.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=32).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_read_all_is_a_copy() {
        let store = StateStore::new();
        store.write("x", json!(1), None).await.unwrap();

        let snapshot = store.read_all().await;
        store.write("x", json!(2), None).await.unwrap();

        assert_eq!(snapshot["x"].value, json!(1));
        assert_eq!(snapshot["x"].version, 1);
    }

    #[tokio::test]
    async fn test_read_keys_omits_unknown() {
        let store = StateStore::new();
        store.write("a", json!(1), None).await.unwrap();
        store.write("b", json!(2), None).await.unwrap();

        let snapshot = store.read_keys(&["a".into(), "missing".into()]).await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("a"));
    }
}
