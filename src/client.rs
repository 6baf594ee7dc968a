//! The Apollo client agent
//!
//! Owns the per-namespace state, keeps it fresh through the notification
//! long poll, and fans change events out to watchers. One instance serves
//! one `(appId, cluster)` identity.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reqwest::StatusCode;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::backup::BackupStore;
use crate::balancer::{AutoFetchBalancer, Balancer, RoundRobin};
use crate::change::diff;
use crate::error::{ClientError, Result};
use crate::model::{
    value_to_string, Configurations, Notification, DEFAULT_NAMESPACE, DEFAULT_NOTIFICATION_ID,
    PENDING_NOTIFICATION_ID,
};
use crate::options::{resolve_config_server_urls, AppConfigFile, ClientOptions, GetOptions};
use crate::store::NamespaceStore;
use crate::subscription::{
    fix_watch_namespace, ApolloResponse, LongPollerError, SubscriptionHub,
};
use crate::transport::{ApolloApi, ApolloHttpApi};

/// Result of one pass through the reload pipeline.
///
/// `status` is `None` when no HTTP round trip happened (balancer empty,
/// connection failure). A set `error` means the snapshot trio was not
/// advanced and the notification id must not move either.
struct ReloadOutcome {
    status: Option<StatusCode>,
    configurations: Configurations,
    error: Option<ClientError>,
}

impl ReloadOutcome {
    fn failed(error: ClientError) -> Self {
        Self {
            status: None,
            configurations: Configurations::new(),
            error: Some(error),
        }
    }
}

struct ClientInner {
    app_id: String,
    opts: ClientOptions,
    api: Arc<dyn ApolloApi>,
    balancer: Arc<dyn Balancer>,
    store: NamespaceStore,
    backup: BackupStore,
    hub: SubscriptionHub,
    errors_tx: broadcast::Sender<LongPollerError>,
    shutdown: broadcast::Sender<()>,
    poll_started: AtomicBool,
    heartbeat_started: AtomicBool,
    stopped: AtomicBool,
}

/// Long-lived agent over one application's Apollo namespaces.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ApolloClient {
    inner: Arc<ClientInner>,
}

impl ApolloClient {
    /// Build a client and fetch the preload namespaces.
    ///
    /// The first preload failure is returned, but initialization still runs
    /// for every namespace so a recovering server picks the rest up later.
    pub async fn new(
        config_server_url: &str,
        app_id: &str,
        options: ClientOptions,
    ) -> Result<Self> {
        let mut options = options;

        let api: Arc<dyn ApolloApi> = match options.api.take() {
            Some(api) => api,
            None => Arc::new(
                ApolloHttpApi::new()?
                    .with_ip(&options.ip)
                    .with_config_type(&options.config_type)
                    .with_access_key(&options.access_key),
            ),
        };

        let balancer: Arc<dyn Balancer> = match options.balancer.take() {
            Some(balancer) => balancer,
            None => {
                let urls = resolve_config_server_urls(config_server_url);
                if options.enable_slb || urls.is_empty() {
                    AutoFetchBalancer::new(
                        api.clone(),
                        config_server_url,
                        app_id,
                        options.refresh_interval,
                    )
                    .await?
                } else {
                    Arc::new(RoundRobin::new(urls))
                }
            }
        };

        if !options.default_namespace.is_empty()
            && !options
                .preload_namespaces
                .contains(&options.default_namespace)
        {
            options.preload_namespaces.push(options.default_namespace.clone());
        }

        let (errors_tx, _) = broadcast::channel(1);
        let (shutdown, _) = broadcast::channel(1);

        let client = Self {
            inner: Arc::new(ClientInner {
                app_id: app_id.to_string(),
                backup: BackupStore::new(options.backup_file.clone()),
                store: NamespaceStore::new(),
                hub: SubscriptionHub::new(),
                api,
                balancer,
                errors_tx,
                shutdown,
                poll_started: AtomicBool::new(false),
                heartbeat_started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                opts: options,
            }),
        };

        let preload = client.inner.opts.preload_namespaces.clone();
        client.init_namespaces(&preload).await?;
        Ok(client)
    }

    /// Build a client from a JSON bootstrap file
    /// (`{appId, cluster, namespaceNames, ip, accessKey}`).
    pub async fn with_config_file(
        path: impl AsRef<Path>,
        options: ClientOptions,
    ) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let file: AppConfigFile = serde_json::from_slice(&data)?;

        let mut options = options;
        if !file.cluster.is_empty() {
            options.cluster = file.cluster.clone();
        }
        if !file.access_key.is_empty() {
            options.access_key = file.access_key.clone();
        }
        options
            .preload_namespaces
            .extend(file.namespace_names.iter().cloned());

        Self::new(&file.ip, &file.app_id, options).await
    }

    /// Start the long-poll loop and, when enabled, the heartbeat loop.
    ///
    /// Idempotent; every call returns a fresh receiver of the best-effort
    /// error channel (capacity one, older events dropped).
    pub fn start(&self) -> broadcast::Receiver<LongPollerError> {
        if self
            .inner
            .poll_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let client = self.clone();
            tokio::spawn(async move {
                let mut shutdown_rx = client.inner.shutdown.subscribe();
                let interval = client.inner.opts.long_poll_interval;
                loop {
                    if client.inner.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(interval) => client.long_poll().await,
                    }
                }
                debug!("long poller stopped");
            });
        }

        if self.inner.opts.enable_heartbeat
            && self
                .inner
                .heartbeat_started
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let client = self.clone();
            tokio::spawn(async move {
                let mut shutdown_rx = client.inner.shutdown.subscribe();
                let interval = client.inner.opts.heartbeat_interval;
                loop {
                    if client.inner.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(interval) => client.heartbeat().await,
                    }
                }
                debug!("heartbeat stopped");
            });
        }

        self.inner.errors_tx.subscribe()
    }

    /// Stop all loops and the balancer. Idempotent. Watch channels are left
    /// open so in-flight sends cannot hit a closed channel.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.balancer.stop();
        let _ = self.inner.shutdown.send(());
    }

    /// The app id this client serves.
    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    /// The effective options of this client.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.opts
    }

    /// Read one key as a string from the default namespace.
    pub async fn get(&self, key: &str) -> String {
        self.get_with(key, GetOptions::default()).await
    }

    /// Read one key as a string. Namespace resolution: the call's namespace,
    /// then the client's default namespace, then `application`. Missing keys
    /// yield the call's default value.
    pub async fn get_with(&self, key: &str, opts: GetOptions) -> String {
        let namespace = match opts.namespace.filter(|ns| !ns.is_empty()) {
            Some(namespace) => namespace,
            None if !self.inner.opts.default_namespace.is_empty() => {
                self.inner.opts.default_namespace.clone()
            }
            None => DEFAULT_NAMESPACE.to_string(),
        };

        match self.get_namespace(&namespace).await.get(key) {
            Some(value) => value_to_string(value),
            None => opts.default_value.unwrap_or_default(),
        }
    }

    /// The cached snapshot of one namespace.
    ///
    /// An unknown namespace is fetched first when auto-fetch-on-cache-miss
    /// is enabled, otherwise it comes back empty (and stays registered as
    /// empty). Read paths never fail; fetch problems go to the logs and the
    /// error channel.
    pub async fn get_namespace(&self, namespace: &str) -> Configurations {
        let (configurations, existed) = self.inner.store.configurations_or_init(namespace);
        if !existed && self.inner.opts.auto_fetch_on_cache_miss {
            if let Err(e) = self.init_namespaces(&[namespace.to_string()]).await {
                warn!(namespace, error = %e, "init on cache miss failed");
            }
            return self.inner.store.configurations(namespace);
        }
        configurations
    }

    /// Receive every namespace's change events. The newest receiver wins.
    pub fn watch(&self) -> mpsc::Receiver<ApolloResponse> {
        self.inner.hub.watch()
    }

    /// Receive one namespace's change events until `stop` fires (or its
    /// sender is dropped) or the client stops.
    ///
    /// The namespace is keyed by its server-side name: no extension means
    /// `.properties` is appended. A namespace not seen before is registered
    /// with the server; registration failures arrive on the returned channel
    /// as a response with `error` set.
    pub fn watch_namespace(
        &self,
        namespace: &str,
        stop: oneshot::Receiver<()>,
    ) -> mpsc::Receiver<ApolloResponse> {
        let fixed = fix_watch_namespace(namespace);
        let rx = self.inner.hub.register_namespace(&fixed);

        let client = self.clone();
        let namespace = namespace.to_string();
        tokio::spawn(async move {
            let mut shutdown_rx = client.inner.shutdown.subscribe();

            if let Err(e) = client.init_namespaces(&[namespace.clone()]).await {
                warn!(namespace = %namespace, error = %e, "watch namespace init failed");
                client
                    .inner
                    .hub
                    .send_to_namespace(&fixed, ApolloResponse::failure(namespace, e))
                    .await;
            }

            if !client.inner.stopped.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = stop => {}
                    _ = shutdown_rx.recv() => {}
                }
            }
            client.inner.hub.unregister_namespace(&fixed);
        });

        rx
    }

    /// Fetch namespaces not seen before and obtain their initial
    /// notification ids. Gated once per namespace for the client's lifetime.
    async fn init_namespaces(&self, namespaces: &[String]) -> Result<()> {
        let mut first_error = None;

        for namespace in namespaces {
            if !self.inner.store.mark_initializing(namespace) {
                continue;
            }

            let outcome = self.reload_namespace(namespace).await;
            self.set_notification_id_from_remote(
                namespace,
                outcome.status == Some(StatusCode::OK),
            )
            .await;

            if let Some(e) = outcome.error {
                warn!(namespace = %namespace, error = %e, "namespace init failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Seed the notification id of a freshly initialized namespace.
    ///
    /// The probe only runs for a namespace the server just served with 200:
    /// asking the notification endpoint about an unknown namespace would
    /// hold the request for the full long-poll window. Everything else just
    /// gets the unknown-id entry so the long poll starts asking about it.
    async fn set_notification_id_from_remote(&self, namespace: &str, fetched_ok: bool) {
        if !fetched_ok {
            self.inner
                .store
                .ensure_notification_id(namespace, DEFAULT_NOTIFICATION_ID);
            return;
        }

        let probe = vec![Notification::new(namespace, DEFAULT_NOTIFICATION_ID)];
        match self.remote_notifications(&probe).await {
            Ok((_, remote)) if !remote.is_empty() => {
                for notification in remote {
                    self.inner
                        .store
                        .set_notification_id(&notification.namespace_name, notification.notification_id);
                }
            }
            // A failed probe must not block startup; fail tolerance depends
            // on construction surviving an unreachable control plane.
            _ => self
                .inner
                .store
                .ensure_notification_id(namespace, DEFAULT_NOTIFICATION_ID),
        }
    }

    /// One pass of the reload pipeline: fetch the namespace uncached and
    /// reconcile local state with the answer.
    ///
    /// On 200 the snapshot, release key and backup advance together; on 304
    /// nothing moves; on 404 the namespace becomes an empty snapshot whose
    /// pending id keeps it in the poll set. The notification id itself is
    /// never advanced here.
    async fn reload_namespace(&self, namespace: &str) -> ReloadOutcome {
        let inner = &self.inner;

        let server = match inner.balancer.select() {
            Ok(server) => server,
            Err(e) => {
                warn!(namespace, error = %e, "balancer select failed");
                return ReloadOutcome::failed(e);
            }
        };

        let release_key = inner.store.release_key(namespace);
        let result = inner
            .api
            .get_configs_from_non_cache(
                &server,
                &inner.app_id,
                &inner.opts.cluster,
                namespace,
                &release_key,
            )
            .await;

        match result {
            Ok((status, Some(config))) if status == StatusCode::OK => {
                inner
                    .store
                    .set_configurations(namespace, config.configurations.clone());
                inner.store.set_release_key(namespace, &config.release_key);

                let mut error = None;
                if let Err(e) = inner.backup.save(namespace, &config.configurations) {
                    warn!(
                        file = %inner.backup.path().display(),
                        namespace,
                        error = %e,
                        "backup write failed"
                    );
                    error = Some(e);
                }
                ReloadOutcome {
                    status: Some(status),
                    configurations: config.configurations,
                    error,
                }
            }
            Ok((status, _)) if status == StatusCode::NOT_MODIFIED => ReloadOutcome {
                status: Some(status),
                configurations: inner.store.configurations(namespace),
                error: None,
            },
            Ok((status, _)) if status == StatusCode::NOT_FOUND => {
                // Not on the server yet. An empty snapshot plus the pending
                // id keeps the namespace polled, so its later creation is
                // seen without a restart. A stale 404 from a lagging replica
                // cannot move an already-live id backwards.
                inner
                    .store
                    .set_configurations(namespace, Configurations::new());
                match inner.store.notification_id(namespace) {
                    None | Some(DEFAULT_NOTIFICATION_ID) => inner
                        .store
                        .set_notification_id(namespace, PENDING_NOTIFICATION_ID),
                    Some(_) => {}
                }
                ReloadOutcome {
                    status: Some(status),
                    configurations: Configurations::new(),
                    error: None,
                }
            }
            Ok((status, _)) => {
                warn!(server = %server, namespace, %status, "config fetch answered unexpectedly");
                self.with_backup_fallback(namespace, Some(status), ClientError::UnexpectedStatus(status))
            }
            Err(e) => {
                warn!(server = %server, namespace, error = %e, "config fetch failed");
                self.with_backup_fallback(namespace, None, e)
            }
        }
    }

    /// Substitute the backup snapshot for a failed fetch when fail
    /// tolerance is on and the backup has this namespace; the release key
    /// and notification id stay put either way.
    fn with_backup_fallback(
        &self,
        namespace: &str,
        status: Option<StatusCode>,
        error: ClientError,
    ) -> ReloadOutcome {
        if self.inner.opts.fail_tolerant_on_backup_exists {
            match self.inner.backup.load() {
                Ok(mut backup) => {
                    if let Some(configurations) = backup.remove(namespace) {
                        self.inner
                            .store
                            .set_configurations(namespace, configurations.clone());
                        return ReloadOutcome {
                            status,
                            configurations,
                            error: None,
                        };
                    }
                }
                Err(e) => {
                    warn!(
                        file = %self.inner.backup.path().display(),
                        namespace,
                        error = %e,
                        "backup load failed"
                    );
                }
            }
        }

        ReloadOutcome {
            status,
            configurations: Configurations::new(),
            error: Some(error),
        }
    }

    /// One long-poll iteration.
    async fn long_poll(&self) {
        let local = self.inner.store.local_notifications();

        let (server, notifications) = match self.remote_notifications(&local).await {
            Ok(result) => result,
            Err(e) => {
                self.send_error("", Vec::new(), "", e);
                return;
            }
        };

        // 200 carries the namespaces with newer ids; 304 comes through as an
        // empty list and the loop just idles until the next tick.
        for notification in &notifications {
            let namespace = &notification.namespace_name;
            let old_value = self.inner.store.configurations(namespace);

            let outcome = self.reload_namespace(namespace).await;
            if let Some(e) = outcome.error {
                self.send_error(&server, notifications.clone(), namespace, e);
                continue;
            }

            // Notification ahead of a lagging non-cache replica; leave the
            // id alone and let a later poll converge.
            if outcome.status == Some(StatusCode::NOT_MODIFIED) {
                continue;
            }

            // A 200 with an identical payload happens on some clusters; if
            // the id advanced anyway we would stop seeing this namespace
            // until the next real change.
            let changes = diff(&old_value, &outcome.configurations);
            if changes.is_empty() {
                continue;
            }

            self.inner
                .hub
                .publish(ApolloResponse {
                    namespace: namespace.clone(),
                    old_value,
                    new_value: outcome.configurations,
                    changes,
                    error: None,
                })
                .await;

            self.inner
                .store
                .set_notification_id(namespace, notification.notification_id);
        }
    }

    /// One heartbeat walk: re-verify every known namespace against its
    /// release key and force-refresh whatever the server reports newer.
    ///
    /// A safety net for silently lost notifications. Unlike the long poll
    /// it has no server-provided id to store, so notification ids are left
    /// untouched.
    async fn heartbeat(&self) {
        let server = match self.inner.balancer.select() {
            Ok(server) => server,
            Err(e) => {
                warn!(error = %e, "balancer select failed");
                return;
            }
        };

        for (namespace, release_key) in self.inner.store.release_key_entries() {
            let result = self
                .inner
                .api
                .get_configs_from_non_cache(
                    &server,
                    &self.inner.app_id,
                    &self.inner.opts.cluster,
                    &namespace,
                    &release_key,
                )
                .await;

            let config = match result {
                Ok((status, Some(config))) if status == StatusCode::OK => config,
                Ok(_) => continue,
                Err(e) => {
                    debug!(namespace = %namespace, error = %e, "heartbeat fetch failed");
                    continue;
                }
            };

            let old_value = self.inner.store.configurations(&namespace);
            self.inner
                .store
                .set_configurations(&namespace, config.configurations.clone());
            self.inner
                .store
                .set_release_key(&namespace, &config.release_key);
            if let Err(e) = self.inner.backup.save(&namespace, &config.configurations) {
                warn!(
                    file = %self.inner.backup.path().display(),
                    namespace = %namespace,
                    error = %e,
                    "backup write failed"
                );
            }

            let changes = diff(&old_value, &config.configurations);
            if !changes.is_empty() {
                self.inner
                    .hub
                    .publish(ApolloResponse {
                        namespace: namespace.clone(),
                        old_value,
                        new_value: config.configurations,
                        changes,
                        error: None,
                    })
                    .await;
            }
        }
    }

    async fn remote_notifications(
        &self,
        local: &[Notification],
    ) -> Result<(String, Vec<Notification>)> {
        let server = self.inner.balancer.select()?;
        let (_, notifications) = self
            .inner
            .api
            .notifications(&server, &self.inner.app_id, &self.inner.opts.cluster, local)
            .await?;
        Ok((server, notifications))
    }

    /// Best-effort error delivery: one pending event per receiver, dropped
    /// when nobody listens.
    fn send_error(
        &self,
        config_server_url: &str,
        notifications: Vec<Notification>,
        namespace: &str,
        error: ClientError,
    ) {
        warn!(
            server = config_server_url,
            namespace,
            error = %error,
            "long poll failed"
        );
        let _ = self.inner.errors_tx.send(LongPollerError {
            config_server_url: config_server_url.to_string(),
            app_id: self.inner.app_id.clone(),
            cluster: self.inner.opts.cluster.clone(),
            notifications,
            namespace: namespace.to_string(),
            error: Arc::new(error),
        });
    }
}
