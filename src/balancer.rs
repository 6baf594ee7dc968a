//! Config-server selection
//!
//! A [`Balancer`] hands the loops one server URL per call. The plain
//! [`RoundRobin`] rotates a fixed list; [`AutoFetchBalancer`] additionally
//! rediscovers the list from the meta server on a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::transport::{normalize_url, split_server_urls, ApolloApi};

/// Refresh cadence of the auto-fetch variant.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_META_URL: &str = "http://apollo.meta";

/// Picks the config server for each outbound call.
pub trait Balancer: Send + Sync {
    fn select(&self) -> Result<String>;
    /// Stop any background refresh; selection keeps working on the last list.
    fn stop(&self);
}

/// Rotates through a fixed server list with an atomic counter.
pub struct RoundRobin {
    urls: Vec<String>,
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            counter: AtomicU64::new(0),
        }
    }
}

impl Balancer for RoundRobin {
    fn select(&self) -> Result<String> {
        if self.urls.is_empty() {
            return Err(ClientError::NoConfigServerAvailable);
        }
        let turn = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = (turn % self.urls.len() as u64) as usize;
        Ok(self.urls[index].clone())
    }

    fn stop(&self) {}
}

/// Rotation over the server list the meta server reports, refreshed by a
/// background task.
pub struct AutoFetchBalancer {
    app_id: String,
    meta_server_url: String,
    api: Arc<dyn ApolloApi>,
    inner: RwLock<RoundRobin>,
    shutdown: broadcast::Sender<()>,
}

impl AutoFetchBalancer {
    /// Seed the rotation with `config_server_url`, perform one refresh (its
    /// failure fails construction), then keep refreshing in the background.
    pub async fn new(
        api: Arc<dyn ApolloApi>,
        config_server_url: &str,
        app_id: &str,
        refresh_interval: Duration,
    ) -> Result<Arc<Self>> {
        let refresh_interval = if refresh_interval.is_zero() {
            DEFAULT_REFRESH_INTERVAL
        } else {
            refresh_interval
        };

        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let balancer = Arc::new(Self {
            app_id: app_id.to_string(),
            meta_server_url: resolve_meta_url(config_server_url),
            api,
            inner: RwLock::new(RoundRobin::new(vec![normalize_url(config_server_url)])),
            shutdown,
        });

        balancer.refresh().await?;

        let worker = balancer.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_interval);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = worker.refresh().await {
                            warn!(meta = %worker.meta_server_url, error = %e, "config server refresh failed");
                        }
                    }
                }
            }
            debug!("config server refresh loop stopped");
        });

        Ok(balancer)
    }

    /// Fetch the server list from the meta server and swap the rotation.
    ///
    /// The swap only happens when at least one fetched URL answers the
    /// services endpoint with a usable status; the rotation then uses every
    /// fetched server, not just the probed one.
    async fn refresh(&self) -> Result<()> {
        let (_, servers) = self
            .api
            .get_config_servers(&self.meta_server_url, &self.app_id)
            .await?;

        let urls: Vec<String> = servers
            .iter()
            .map(|server| normalize_url(&server.homepage_url))
            .collect();
        if urls.is_empty() {
            return Ok(());
        }

        let mut usable = false;
        for url in &urls {
            match self.api.get_config_servers(url, &self.app_id).await {
                Ok((status, _)) if (200..400).contains(&status.as_u16()) => {
                    usable = true;
                    break;
                }
                Ok(_) | Err(_) => continue,
            }
        }
        if !usable {
            return Ok(());
        }

        debug!(servers = urls.len(), "config server list refreshed");
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner = RoundRobin::new(urls);
        Ok(())
    }
}

impl Balancer for AutoFetchBalancer {
    fn select(&self) -> Result<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .select()
    }

    fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Meta-server resolution: explicit argument, then `APOLLO_META`, then the
/// well-known default. A comma-separated candidate list yields one random
/// pick, mirroring the Java client.
fn resolve_meta_url(config_server_url: &str) -> String {
    let env = std::env::var("APOLLO_META").unwrap_or_default();
    for candidate in [config_server_url, env.as_str()] {
        if candidate.is_empty() {
            continue;
        }
        let urls = split_server_urls(candidate);
        if let Some(url) = urls.choose(&mut rand::thread_rng()) {
            return url.clone();
        }
    }
    DEFAULT_META_URL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::StatusCode;

    use crate::model::{ApolloConfig, ConfigServer, Configurations, Notification};

    #[test]
    fn test_round_robin_rotation() {
        let balancer = RoundRobin::new(vec![
            "http://s1:8080".to_string(),
            "http://s2:8080".to_string(),
        ]);
        assert_eq!(balancer.select().unwrap(), "http://s1:8080");
        assert_eq!(balancer.select().unwrap(), "http://s2:8080");
        assert_eq!(balancer.select().unwrap(), "http://s1:8080");
    }

    #[test]
    fn test_round_robin_empty() {
        let balancer = RoundRobin::new(Vec::new());
        assert!(matches!(
            balancer.select(),
            Err(ClientError::NoConfigServerAvailable)
        ));
    }

    #[test]
    fn test_resolve_meta_url_explicit_wins() {
        assert_eq!(resolve_meta_url("meta:8080"), "http://meta:8080");
    }

    struct MetaOnlyApi {
        servers: Vec<ConfigServer>,
    }

    #[async_trait]
    impl ApolloApi for MetaOnlyApi {
        async fn notifications(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &[Notification],
        ) -> Result<(StatusCode, Vec<Notification>)> {
            Ok((StatusCode::NOT_MODIFIED, Vec::new()))
        }

        async fn get_configs_from_non_cache(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<(StatusCode, Option<ApolloConfig>)> {
            Ok((StatusCode::NOT_FOUND, None))
        }

        async fn get_configs_from_cache(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Configurations> {
            Ok(Configurations::new())
        }

        async fn get_config_servers(
            &self,
            _: &str,
            _: &str,
        ) -> Result<(StatusCode, Vec<ConfigServer>)> {
            Ok((StatusCode::OK, self.servers.clone()))
        }
    }

    #[tokio::test]
    async fn test_auto_fetch_swaps_in_fetched_list() {
        let api = Arc::new(MetaOnlyApi {
            servers: vec![
                ConfigServer {
                    app_name: "APOLLO-CONFIGSERVICE".to_string(),
                    instance_id: "i-1".to_string(),
                    homepage_url: "http://cs1:8080/".to_string(),
                },
                ConfigServer {
                    app_name: "APOLLO-CONFIGSERVICE".to_string(),
                    instance_id: "i-2".to_string(),
                    homepage_url: "http://cs2:8080/".to_string(),
                },
            ],
        });

        let balancer =
            AutoFetchBalancer::new(api, "http://seed:8080", "app", Duration::from_secs(60))
                .await
                .unwrap();

        let first = balancer.select().unwrap();
        let second = balancer.select().unwrap();
        assert_eq!(first, "http://cs1:8080");
        assert_eq!(second, "http://cs2:8080");

        balancer.stop();
    }

    #[tokio::test]
    async fn test_auto_fetch_keeps_seed_on_empty_list() {
        let api = Arc::new(MetaOnlyApi { servers: Vec::new() });

        let balancer =
            AutoFetchBalancer::new(api, "seed:8080", "app", Duration::from_secs(60))
                .await
                .unwrap();

        assert_eq!(balancer.select().unwrap(), "http://seed:8080");
        balancer.stop();
    }
}
