//! Which connected clients want which keys.
//!
//! The registry only indexes client ids; the client records themselves
//! (queues, identities) belong to the connection that created them.
//!
//! A client subscribed to ALL may still opt out of single keys: those are
//! kept as exclusions until the client subscribes to them again or
//! unsubscribes from ALL.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::KeySet;

#[derive(Debug, Default)]
struct Interest {
    all: bool,
    keys: HashSet<String>,
    excluded: HashSet<String>,
}

#[derive(Debug, Default)]
struct Index {
    clients: HashMap<Uuid, Interest>,
    by_key: HashMap<String, HashSet<Uuid>>,
    wildcard: HashSet<Uuid>,
}

impl Index {
    fn unlink_key(&mut self, client_id: &Uuid, key: &str) {
        if let Some(ids) = self.by_key.get_mut(key) {
            ids.remove(client_id);
            if ids.is_empty() {
                self.by_key.remove(key);
            }
        }
    }
}

/// Subscription index: key → interested clients.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    index: RwLock<Index>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add interest in `keys`. Subscriptions are additive.
    pub async fn subscribe(&self, client_id: Uuid, keys: &KeySet) {
        let mut guard = self.index.write().await;
        let index = &mut *guard;
        let interest = index.clients.entry(client_id).or_default();

        match keys {
            KeySet::All => {
                interest.all = true;
                interest.excluded.clear();
                index.wildcard.insert(client_id);
            }
            KeySet::Keys(keys) => {
                for key in keys {
                    interest.excluded.remove(key);
                    interest.keys.insert(key.clone());
                }
                for key in keys {
                    index.by_key.entry(key.clone()).or_default().insert(client_id);
                }
            }
        }
    }

    /// Drop interest in `keys`. Keys that were never subscribed are ignored.
    pub async fn unsubscribe(&self, client_id: Uuid, keys: &KeySet) {
        let mut guard = self.index.write().await;
        let index = &mut *guard;
        let Some(interest) = index.clients.get_mut(&client_id) else {
            return;
        };

        match keys {
            KeySet::All => {
                let dropped: Vec<String> = interest.keys.drain().collect();
                interest.excluded.clear();
                interest.all = false;
                index.wildcard.remove(&client_id);
                for key in dropped {
                    index.unlink_key(&client_id, &key);
                }
            }
            KeySet::Keys(keys) => {
                let mut dropped = Vec::new();
                for key in keys {
                    if interest.keys.remove(key) {
                        dropped.push(key.as_str());
                    }
                    if interest.all {
                        interest.excluded.insert(key.clone());
                    }
                }
                for key in dropped {
                    index.unlink_key(&client_id, key);
                }
            }
        }
    }

    /// Forget a client entirely. Returns whether it was registered.
    ///
    /// Runs under one write lock, so a concurrent lookup sees the client
    /// either fully subscribed or fully gone.
    pub async fn remove(&self, client_id: &Uuid) -> bool {
        let mut index = self.index.write().await;
        let Some(interest) = index.clients.remove(client_id) else {
            return false;
        };
        index.wildcard.remove(client_id);
        for key in &interest.keys {
            index.unlink_key(client_id, key);
        }
        true
    }

    /// Clients that should receive changes to `key`.
    pub async fn subscribers_for(&self, key: &str) -> HashSet<Uuid> {
        let index = self.index.read().await;
        let mut ids: HashSet<Uuid> = index.by_key.get(key).cloned().unwrap_or_default();
        for id in &index.wildcard {
            let excluded = index
                .clients
                .get(id)
                .is_some_and(|i| i.excluded.contains(key));
            if !excluded {
                ids.insert(*id);
            }
        }
        ids
    }

    pub async fn is_subscribed(&self, client_id: &Uuid, key: &str) -> bool {
        let index = self.index.read().await;
        index.clients.get(client_id).is_some_and(|i| {
            i.keys.contains(key) || (i.all && !i.excluded.contains(key))
        })
    }

    pub async fn client_count(&self) -> usize {
        self.index.read().await.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_explicit_keys() {
        let registry = SubscriptionRegistry::new();
        let alice = Uuid::new_v4();
        registry.subscribe(alice, &KeySet::keys(["x", "y"])).await;

        assert!(registry.subscribers_for("x").await.contains(&alice));
        assert!(registry.subscribers_for("y").await.contains(&alice));
        assert!(registry.subscribers_for("z").await.is_empty());
    }

    #[tokio::test]
    async fn test_all_receives_every_key() {
        let registry = SubscriptionRegistry::new();
        let dashboard = Uuid::new_v4();
        registry.subscribe(dashboard, &KeySet::All).await;

        assert!(registry.subscribers_for("anything").await.contains(&dashboard));
        assert!(registry.is_subscribed(&dashboard, "else").await);
    }

    #[tokio::test]
    async fn test_subscriptions_are_additive() {
        let registry = SubscriptionRegistry::new();
        let id = Uuid::new_v4();
        registry.subscribe(id, &KeySet::keys(["a"])).await;
        registry.subscribe(id, &KeySet::keys(["b"])).await;

        assert!(registry.is_subscribed(&id, "a").await);
        assert!(registry.is_subscribed(&id, "b").await);
    }

    #[tokio::test]
    async fn test_unsubscribe_key() {
        let registry = SubscriptionRegistry::new();
        let id = Uuid::new_v4();
        registry.subscribe(id, &KeySet::keys(["a", "b"])).await;
        registry.unsubscribe(id, &KeySet::keys(["a"])).await;

        assert!(registry.subscribers_for("a").await.is_empty());
        assert!(registry.subscribers_for("b").await.contains(&id));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_key_is_noop() {
        let registry = SubscriptionRegistry::new();
        let id = Uuid::new_v4();
        registry.subscribe(id, &KeySet::keys(["a"])).await;
        registry.unsubscribe(id, &KeySet::keys(["never"])).await;
        registry.unsubscribe(Uuid::new_v4(), &KeySet::All).await;

        assert!(registry.is_subscribed(&id, "a").await);
        assert_eq!(registry.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_key_from_all_excludes_it() {
        let registry = SubscriptionRegistry::new();
        let id = Uuid::new_v4();
        registry.subscribe(id, &KeySet::All).await;
        registry.unsubscribe(id, &KeySet::keys(["noisy"])).await;

        assert!(!registry.subscribers_for("noisy").await.contains(&id));
        assert!(registry.subscribers_for("quiet").await.contains(&id));

        // Subscribing again lifts the exclusion.
        registry.subscribe(id, &KeySet::keys(["noisy"])).await;
        assert!(registry.subscribers_for("noisy").await.contains(&id));
    }

    #[tokio::test]
    async fn test_unsubscribe_all_drops_everything() {
        let registry = SubscriptionRegistry::new();
        let id = Uuid::new_v4();
        registry.subscribe(id, &KeySet::All).await;
        registry.subscribe(id, &KeySet::keys(["x"])).await;
        registry.unsubscribe(id, &KeySet::All).await;

        assert!(registry.subscribers_for("x").await.is_empty());
        assert!(registry.subscribers_for("y").await.is_empty());
        assert_eq!(registry.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_purges_every_key() {
        let registry = SubscriptionRegistry::new();
        let gone = Uuid::new_v4();
        let stays = Uuid::new_v4();
        registry.subscribe(gone, &KeySet::All).await;
        registry.subscribe(gone, &KeySet::keys(["x", "y"])).await;
        registry.subscribe(stays, &KeySet::keys(["x"])).await;

        assert!(registry.remove(&gone).await);
        assert!(!registry.remove(&gone).await);

        assert_eq!(
            registry.subscribers_for("x").await,
            HashSet::from([stays])
        );
        assert!(registry.subscribers_for("y").await.is_empty());
        assert_eq!(registry.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_mixed_subscribers() {
        let registry = SubscriptionRegistry::new();
        let motor = Uuid::new_v4();
        let vision = Uuid::new_v4();
        let ui = Uuid::new_v4();
        registry.subscribe(motor, &KeySet::keys(["throttle"])).await;
        registry.subscribe(vision, &KeySet::keys(["recognition"])).await;
        registry.subscribe(ui, &KeySet::All).await;

        assert_eq!(
            registry.subscribers_for("throttle").await,
            HashSet::from([motor, ui])
        );
        assert_eq!(
            registry.subscribers_for("recognition").await,
            HashSet::from([vision, ui])
        );
    }
}
