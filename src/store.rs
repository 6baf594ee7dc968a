//! In-memory per-namespace state
//!
//! Four concurrent maps keyed by namespace name. Readers never wait on
//! writers; a scan may observe the maps mid-update, which is fine because
//! the reload pipeline is the only writer of the snapshot trio and readers
//! only consult the configurations map.

use dashmap::DashMap;

use crate::model::{Configurations, Notification, DEFAULT_NOTIFICATION_ID};

/// Holder of `{notification id, release key, configurations, initialized}`
/// per namespace.
#[derive(Default)]
pub struct NamespaceStore {
    notification_ids: DashMap<String, i64>,
    release_keys: DashMap<String, String>,
    cache: DashMap<String, Configurations>,
    initialized: DashMap<String, ()>,
}

impl NamespaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to initialize a namespace; only the first caller
    /// gets `true`.
    pub fn mark_initializing(&self, namespace: &str) -> bool {
        self.initialized.insert(namespace.to_string(), ()).is_none()
    }

    pub fn notification_id(&self, namespace: &str) -> Option<i64> {
        self.notification_ids.get(namespace).map(|id| *id)
    }

    pub fn set_notification_id(&self, namespace: &str, id: i64) {
        self.notification_ids.insert(namespace.to_string(), id);
    }

    /// Insert `id` only when no id is stored yet.
    pub fn ensure_notification_id(&self, namespace: &str, id: i64) {
        self.notification_ids
            .entry(namespace.to_string())
            .or_insert(id);
    }

    /// Snapshot of `(namespace, last known id)` pairs for the long poll.
    pub fn local_notifications(&self) -> Vec<Notification> {
        self.notification_ids
            .iter()
            .map(|entry| Notification::new(entry.key().clone(), *entry.value()))
            .collect()
    }

    /// The cached release key, defaulting (and persisting the default) to
    /// empty for a namespace never fetched.
    pub fn release_key(&self, namespace: &str) -> String {
        self.release_keys
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    pub fn set_release_key(&self, namespace: &str, release_key: &str) {
        self.release_keys
            .insert(namespace.to_string(), release_key.to_string());
    }

    /// All namespaces with a known release key, for the heartbeat walk.
    pub fn release_key_entries(&self) -> Vec<(String, String)> {
        self.release_keys
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// The cached snapshot, empty for an unknown namespace.
    pub fn configurations(&self, namespace: &str) -> Configurations {
        self.cache
            .get(namespace)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn set_configurations(&self, namespace: &str, configurations: Configurations) {
        self.cache.insert(namespace.to_string(), configurations);
    }

    /// The cached snapshot plus whether the namespace was already known;
    /// an unknown namespace is registered with an empty snapshot.
    pub fn configurations_or_init(&self, namespace: &str) -> (Configurations, bool) {
        match self.cache.entry(namespace.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), true),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Configurations::new());
                (Configurations::new(), false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mark_initializing_once() {
        let store = NamespaceStore::new();
        assert!(store.mark_initializing("application"));
        assert!(!store.mark_initializing("application"));
        assert!(store.mark_initializing("test.json"));
    }

    #[test]
    fn test_notification_ids() {
        let store = NamespaceStore::new();
        assert_eq!(store.notification_id("application"), None);

        store.ensure_notification_id("application", DEFAULT_NOTIFICATION_ID);
        assert_eq!(store.notification_id("application"), Some(-1));

        // ensure does not clobber an existing id
        store.set_notification_id("application", 42);
        store.ensure_notification_id("application", DEFAULT_NOTIFICATION_ID);
        assert_eq!(store.notification_id("application"), Some(42));
    }

    #[test]
    fn test_local_notifications_snapshot() {
        let store = NamespaceStore::new();
        store.set_notification_id("application", 7);
        store.set_notification_id("test.json", -1);

        let mut local = store.local_notifications();
        local.sort_by(|a, b| a.namespace_name.cmp(&b.namespace_name));
        assert_eq!(
            local,
            vec![
                Notification::new("application", 7),
                Notification::new("test.json", -1),
            ]
        );
    }

    #[test]
    fn test_release_key_defaults_empty() {
        let store = NamespaceStore::new();
        assert_eq!(store.release_key("application"), "");

        store.set_release_key("application", "20181017110222");
        assert_eq!(store.release_key("application"), "20181017110222");
        assert_eq!(
            store.release_key_entries(),
            vec![("application".to_string(), "20181017110222".to_string())]
        );
    }

    #[test]
    fn test_configurations_or_init() {
        let store = NamespaceStore::new();

        let (configurations, existed) = store.configurations_or_init("application");
        assert!(configurations.is_empty());
        assert!(!existed);

        let mut updated = Configurations::new();
        updated.insert("timeout".to_string(), json!("100"));
        store.set_configurations("application", updated.clone());

        let (configurations, existed) = store.configurations_or_init("application");
        assert_eq!(configurations, updated);
        assert!(existed);
    }
}
