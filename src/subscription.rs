//! Change-event fan-out
//!
//! One global channel plus one channel per watched namespace. Sends are
//! bounded: each subscriber gets at most [`WATCH_SEND_TIMEOUT`] of grace,
//! then the event is dropped for that subscriber so a stalled consumer
//! cannot stall the long-poll loop.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::change::Change;
use crate::error::ClientError;
use crate::model::{Configurations, Notification, DEFAULT_CONFIG_TYPE};

/// Per-subscriber grace before an event is dropped.
pub const WATCH_SEND_TIMEOUT: Duration = Duration::from_millis(500);

const WATCH_CHANNEL_CAPACITY: usize = 16;

/// A change event delivered to watchers.
///
/// `error` is only set on the per-namespace channel when registering the
/// namespace with the server failed.
#[derive(Debug, Clone)]
pub struct ApolloResponse {
    pub namespace: String,
    pub old_value: Configurations,
    pub new_value: Configurations,
    pub changes: Vec<Change>,
    pub error: Option<Arc<ClientError>>,
}

impl ApolloResponse {
    pub(crate) fn failure(namespace: impl Into<String>, error: ClientError) -> Self {
        Self {
            namespace: namespace.into(),
            old_value: Configurations::new(),
            new_value: Configurations::new(),
            changes: Vec::new(),
            error: Some(Arc::new(error)),
        }
    }
}

/// A failed long-poll iteration, delivered on the error channel.
#[derive(Debug, Clone)]
pub struct LongPollerError {
    pub config_server_url: String,
    pub app_id: String,
    pub cluster: String,
    /// The notifications in flight when the failure happened.
    pub notifications: Vec<Notification>,
    /// The namespace whose reload failed; empty for poll-level failures.
    pub namespace: String,
    pub error: Arc<ClientError>,
}

/// Registry of the global and per-namespace watch channels.
pub struct SubscriptionHub {
    global_tx: Mutex<Option<mpsc::Sender<ApolloResponse>>>,
    namespace_txs: DashMap<String, mpsc::Sender<ApolloResponse>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self {
            global_tx: Mutex::new(None),
            namespace_txs: DashMap::new(),
        }
    }

    /// Install the global channel. The newest receiver wins; an earlier one
    /// stops receiving.
    pub fn watch(&self) -> mpsc::Receiver<ApolloResponse> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut slot = self.global_tx.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(tx);
        rx
    }

    /// Install the channel for one (suffix-fixed) namespace key.
    pub fn register_namespace(&self, fixed_namespace: &str) -> mpsc::Receiver<ApolloResponse> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.namespace_txs.insert(fixed_namespace.to_string(), tx);
        rx
    }

    pub fn unregister_namespace(&self, fixed_namespace: &str) {
        self.namespace_txs.remove(fixed_namespace);
    }

    pub fn is_watching(&self, fixed_namespace: &str) -> bool {
        self.namespace_txs.contains_key(fixed_namespace)
    }

    /// Deliver an event to the global channel and the namespace's channel.
    pub async fn publish(&self, response: ApolloResponse) {
        let fixed = fix_watch_namespace(&response.namespace);

        let global = self
            .global_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(tx) = global {
            if !bounded_send(&tx, response.clone()).await {
                // receiver gone for good; free the slot
                let mut slot = self.global_tx.lock().unwrap_or_else(|e| e.into_inner());
                *slot = None;
            }
        }

        // Clone the sender out so no map guard lives across the await.
        let namespace_tx = self.namespace_txs.get(&fixed).map(|entry| entry.clone());
        if let Some(tx) = namespace_tx {
            if !bounded_send(&tx, response).await {
                self.namespace_txs.remove(&fixed);
            }
        }
    }

    /// Deliver straight to one namespace channel (watch-time init failures).
    pub async fn send_to_namespace(&self, fixed_namespace: &str, response: ApolloResponse) {
        let tx = self
            .namespace_txs
            .get(fixed_namespace)
            .map(|entry| entry.clone());
        if let Some(tx) = tx {
            if !bounded_send(&tx, response).await {
                self.namespace_txs.remove(fixed_namespace);
            }
        }
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Send with the watch grace period. Returns `false` only when the receiver
/// is gone and the channel should be forgotten.
async fn bounded_send(tx: &mpsc::Sender<ApolloResponse>, response: ApolloResponse) -> bool {
    let namespace = response.namespace.clone();
    match tokio::time::timeout(WATCH_SEND_TIMEOUT, tx.send(response)).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => false,
        Err(_) => {
            debug!(namespace = %namespace, "watch subscriber too slow, event dropped");
            true
        }
    }
}

/// Key a subscriber-supplied namespace the way the server reports it:
/// names without an extension get `.properties` appended, names with one
/// (`test.json`) are kept as is.
pub fn fix_watch_namespace(namespace: &str) -> String {
    match Path::new(namespace).extension() {
        Some(_) => namespace.to_string(),
        None => format!("{}.{}", namespace, DEFAULT_CONFIG_TYPE),
    }
}
