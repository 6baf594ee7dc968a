//! Client configuration
//!
//! `ClientOptions` carries everything but the config-server URL and app id,
//! which are positional arguments of the constructors. Defaults match the
//! common Apollo deployment; every knob has a `with_*` builder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::{Balancer, DEFAULT_REFRESH_INTERVAL};
use crate::model::DEFAULT_CONFIG_TYPE;
use crate::transport::{local_ip, split_server_urls, ApolloApi};

/// Bootstrap file read by [`crate::ApolloClient::with_config_file`].
pub const DEFAULT_CONFIG_FILE_PATH: &str = "app.properties";

pub const DEFAULT_CLUSTER: &str = "default";
pub const DEFAULT_BACKUP_FILE: &str = ".agollo";
pub const DEFAULT_LONG_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

/// Tunables of one client instance.
#[derive(Clone)]
pub struct ClientOptions {
    /// Cluster label partitioning config by deployment target.
    pub cluster: String,
    /// Namespace `get` falls back to; auto-added to the preloads when set.
    pub default_namespace: String,
    /// Namespaces fetched at construction.
    pub preload_namespaces: Vec<String>,
    /// Fetch unknown namespaces on first access instead of serving empty.
    pub auto_fetch_on_cache_miss: bool,
    /// Pause between long-poll iterations.
    pub long_poll_interval: Duration,
    /// Where the fallback snapshot map lives.
    pub backup_file: PathBuf,
    /// Serve the backup snapshot when the config servers are unreachable.
    pub fail_tolerant_on_backup_exists: bool,
    /// Discover config servers through the meta server even when an
    /// explicit server list is available.
    pub enable_slb: bool,
    /// Cadence of the meta-server rediscovery.
    pub refresh_interval: Duration,
    /// Run the slow re-verification walk.
    pub enable_heartbeat: bool,
    pub heartbeat_interval: Duration,
    /// Access key for signed requests; defaults from `APOLLO_ACCESS_KEY`.
    pub access_key: String,
    /// IP reported to the server for grayscale rules.
    pub ip: String,
    /// Content type of the consumed namespaces.
    pub config_type: String,
    /// Replacement transport, mainly for tests.
    pub api: Option<Arc<dyn ApolloApi>>,
    /// Replacement balancer, mainly for tests.
    pub balancer: Option<Arc<dyn Balancer>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cluster: DEFAULT_CLUSTER.to_string(),
            default_namespace: String::new(),
            preload_namespaces: Vec::new(),
            auto_fetch_on_cache_miss: false,
            long_poll_interval: DEFAULT_LONG_POLL_INTERVAL,
            backup_file: PathBuf::from(DEFAULT_BACKUP_FILE),
            fail_tolerant_on_backup_exists: false,
            enable_slb: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            enable_heartbeat: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            access_key: std::env::var("APOLLO_ACCESS_KEY").unwrap_or_default(),
            ip: local_ip(),
            config_type: DEFAULT_CONFIG_TYPE.to_string(),
            api: None,
            balancer: None,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = cluster.to_string();
        self
    }

    pub fn with_default_namespace(mut self, namespace: &str) -> Self {
        self.default_namespace = namespace.to_string();
        self
    }

    pub fn with_preload_namespaces(mut self, namespaces: &[&str]) -> Self {
        self.preload_namespaces
            .extend(namespaces.iter().map(|ns| ns.to_string()));
        self
    }

    pub fn with_auto_fetch_on_cache_miss(mut self) -> Self {
        self.auto_fetch_on_cache_miss = true;
        self
    }

    pub fn with_long_poll_interval(mut self, interval: Duration) -> Self {
        self.long_poll_interval = interval;
        self
    }

    pub fn with_backup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_file = path.into();
        self
    }

    pub fn with_fail_tolerant_on_backup_exists(mut self) -> Self {
        self.fail_tolerant_on_backup_exists = true;
        self
    }

    pub fn with_enable_slb(mut self, enable: bool) -> Self {
        self.enable_slb = enable;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_heartbeat(mut self, enable: bool) -> Self {
        self.enable_heartbeat = enable;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_access_key(mut self, access_key: &str) -> Self {
        self.access_key = access_key.to_string();
        self
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip = ip.to_string();
        self
    }

    pub fn with_config_type(mut self, config_type: &str) -> Self {
        self.config_type = config_type.to_string();
        self
    }

    pub fn with_api(mut self, api: Arc<dyn ApolloApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_balancer(mut self, balancer: Arc<dyn Balancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }
}

/// Per-call options of [`crate::ApolloClient::get_with`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Namespace to read; wins over the client's default namespace.
    pub namespace: Option<String>,
    /// Returned when the key is absent.
    pub default_value: Option<String>,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.default_value = Some(value.to_string());
        self
    }
}

/// Shape of the JSON bootstrap file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfigFile {
    pub app_id: String,
    pub cluster: String,
    pub namespace_names: Vec<String>,
    /// Config-server address to bootstrap against.
    pub ip: String,
    pub access_key: String,
}

/// Config-server list resolution: explicit argument, then the
/// `APOLLO_CONFIGSERVICE` environment variable. Empty means the caller
/// should fall through to meta-server discovery.
pub(crate) fn resolve_config_server_urls(config_server_url: &str) -> Vec<String> {
    let env = std::env::var("APOLLO_CONFIGSERVICE").unwrap_or_default();
    for candidate in [config_server_url, env.as_str()] {
        if !candidate.is_empty() {
            return split_server_urls(candidate);
        }
    }
    Vec::new()
}
