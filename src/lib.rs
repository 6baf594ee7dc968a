//! Apollo Client - Rust SDK for the Apollo configuration center
//!
//! This crate provides:
//! - A long-lived client agent holding the local view of an application's
//!   configuration namespaces
//! - Long-polling of the notification endpoint with per-namespace reloads
//! - Change diffing and fan-out to global and per-namespace watchers
//! - A local backup file used for warm starts and server-outage fallback
//! - Config-server selection with optional meta-server rediscovery
//! - Access-key request signing

pub mod backup;
pub mod balancer;
pub mod change;
pub mod client;
pub mod error;
pub mod model;
pub mod options;
pub mod signature;
pub mod store;
pub mod subscription;
pub mod transport;

pub use backup::BackupStore;
pub use balancer::{AutoFetchBalancer, Balancer, RoundRobin};
pub use change::{diff, Change, ChangeType};
pub use client::ApolloClient;
pub use error::{ClientError, Result};
pub use model::{
    value_to_string, ApolloConfig, ConfigServer, Configurations, Notification,
    DEFAULT_NAMESPACE, DEFAULT_NOTIFICATION_ID, PENDING_NOTIFICATION_ID,
};
pub use options::{AppConfigFile, ClientOptions, GetOptions};
pub use signature::{default_signature, SignatureContext, SignatureFunc};
pub use subscription::{fix_watch_namespace, ApolloResponse, LongPollerError, SubscriptionHub};
pub use transport::{ApolloApi, ApolloHttpApi};
