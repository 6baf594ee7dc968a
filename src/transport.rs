//! HTTP transport for the four Apollo endpoints
//!
//! All operations are idempotent GETs returning `(status, payload)`;
//! a transport or decoding failure is an `Err`, any HTTP status is data
//! for the caller to interpret.

use async_trait::async_trait;
use if_addrs::IfAddr;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::model::{ApolloConfig, ConfigServer, Configurations, Notification, DEFAULT_CONFIG_TYPE};
use crate::signature::{default_signature, SignatureContext, SignatureFunc};

/// The notification endpoint holds requests for up to ~60 s; the client
/// timeout has to outlast that hold.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The Apollo HTTP API surface.
///
/// `config_server_url`, `app_id` and `cluster` travel per call so one
/// transport can serve any server the balancer picks, and so tests can
/// mock the whole surface.
#[async_trait]
pub trait ApolloApi: Send + Sync {
    /// Long-poll `/notifications/v2`. 200 carries the namespaces with newer
    /// ids; 304 means nothing changed and comes back as an empty list.
    async fn notifications(
        &self,
        config_server_url: &str,
        app_id: &str,
        cluster: &str,
        notifications: &[Notification],
    ) -> Result<(StatusCode, Vec<Notification>)>;

    /// Uncached config fetch. 200 carries the payload, 304 means the caller's
    /// `release_key` is current, 404 means the namespace does not exist.
    async fn get_configs_from_non_cache(
        &self,
        config_server_url: &str,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        release_key: &str,
    ) -> Result<(StatusCode, Option<ApolloConfig>)>;

    /// Cached config fetch (`/configfiles/json`), a flat key/value map.
    /// Suited to high-frequency polling; non-200 yields an empty map.
    async fn get_configs_from_cache(
        &self,
        config_server_url: &str,
        app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> Result<Configurations>;

    /// Ask the meta server for the live config-server list.
    async fn get_config_servers(
        &self,
        meta_server_url: &str,
        app_id: &str,
    ) -> Result<(StatusCode, Vec<ConfigServer>)>;
}

/// `reqwest`-backed [`ApolloApi`] implementation.
pub struct ApolloHttpApi {
    client: Client,
    ip: String,
    config_type: String,
    access_key: String,
    signature: SignatureFunc,
}

impl ApolloHttpApi {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_CLIENT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            ip: local_ip(),
            config_type: DEFAULT_CONFIG_TYPE.to_string(),
            access_key: String::new(),
            signature: default_signature,
        })
    }

    /// Report this IP to the server instead of the discovered one.
    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip = ip.to_string();
        self
    }

    /// Content type of the namespaces this client fetches; anything but
    /// `properties` is appended to namespace names on the wire.
    pub fn with_config_type(mut self, config_type: &str) -> Self {
        self.config_type = config_type.to_string();
        self
    }

    /// Sign requests with this access key.
    pub fn with_access_key(mut self, access_key: &str) -> Self {
        self.access_key = access_key.to_string();
        self
    }

    /// Replace the signing scheme.
    pub fn with_signature(mut self, signature: SignatureFunc) -> Self {
        self.signature = signature;
        self
    }

    fn wire_namespace(&self, namespace: &str) -> String {
        if self.config_type.is_empty() || self.config_type == DEFAULT_CONFIG_TYPE {
            return namespace.to_string();
        }
        format!("{}.{}", namespace, self.config_type)
    }

    async fn do_get<T: DeserializeOwned>(
        &self,
        url: Url,
        server_url: &str,
        app_id: &str,
        cluster: &str,
    ) -> Result<(StatusCode, Option<T>)> {
        let request_uri = request_uri(&url);
        let mut request = self.client.get(url);
        let headers = (self.signature)(&SignatureContext {
            app_id,
            access_key: &self.access_key,
            config_server_url: server_url,
            request_uri: &request_uri,
            cluster,
        });
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(%status, uri = %request_uri, "apollo request");

        if status != StatusCode::OK {
            return Ok((status, None));
        }

        let body = response.bytes().await?;
        let decoded = serde_json::from_slice(&body)?;
        Ok((status, Some(decoded)))
    }
}

#[async_trait]
impl ApolloApi for ApolloHttpApi {
    async fn notifications(
        &self,
        config_server_url: &str,
        app_id: &str,
        cluster: &str,
        notifications: &[Notification],
    ) -> Result<(StatusCode, Vec<Notification>)> {
        let server = normalize_url(config_server_url);
        let mut url = parse_url(&server)?;
        with_path_segments(&mut url, &["notifications", "v2"])?;
        url.query_pairs_mut()
            .append_pair("appId", app_id)
            .append_pair("cluster", cluster)
            .append_pair("notifications", &serde_json::to_string(notifications)?);

        let (status, body) = self.do_get(url, &server, app_id, cluster).await?;
        Ok((status, body.unwrap_or_default()))
    }

    async fn get_configs_from_non_cache(
        &self,
        config_server_url: &str,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        release_key: &str,
    ) -> Result<(StatusCode, Option<ApolloConfig>)> {
        let server = normalize_url(config_server_url);
        let mut url = parse_url(&server)?;
        with_path_segments(
            &mut url,
            &["configs", app_id, cluster, &self.wire_namespace(namespace)],
        )?;
        url.query_pairs_mut()
            .append_pair("releaseKey", release_key)
            .append_pair("ip", &self.ip);

        self.do_get(url, &server, app_id, cluster).await
    }

    async fn get_configs_from_cache(
        &self,
        config_server_url: &str,
        app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> Result<Configurations> {
        let server = normalize_url(config_server_url);
        let mut url = parse_url(&server)?;
        with_path_segments(
            &mut url,
            &[
                "configfiles",
                "json",
                app_id,
                cluster,
                &self.wire_namespace(namespace),
            ],
        )?;
        url.query_pairs_mut().append_pair("ip", &self.ip);

        let (_, body) = self.do_get(url, &server, app_id, cluster).await?;
        Ok(body.unwrap_or_default())
    }

    async fn get_config_servers(
        &self,
        meta_server_url: &str,
        app_id: &str,
    ) -> Result<(StatusCode, Vec<ConfigServer>)> {
        let server = normalize_url(meta_server_url);
        let mut url = parse_url(&server)?;
        with_path_segments(&mut url, &["services", "config"])?;
        url.query_pairs_mut()
            .append_pair("id", &self.ip)
            .append_pair("appId", app_id);

        // The meta endpoints are cluster-agnostic.
        let (status, body) = self.do_get(url, &server, app_id, "").await?;
        Ok((status, body.unwrap_or_default()))
    }
}

fn parse_url(server_url: &str) -> Result<Url> {
    Url::parse(server_url)
        .map_err(|e| ClientError::Other(anyhow::anyhow!("invalid server url {server_url}: {e}")))
}

/// Append segments to a URL, keeping any path prefix the server URL carries.
fn with_path_segments(url: &mut Url, segments: &[&str]) -> Result<()> {
    let mut parts = url
        .path_segments_mut()
        .map_err(|_| ClientError::Other(anyhow::anyhow!("server url cannot carry a path")))?;
    parts.pop_if_empty();
    parts.extend(segments);
    Ok(())
}

fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Default the scheme to `http://` and drop a trailing slash.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    };
    url.trim_end_matches('/').to_string()
}

/// Split a comma-separated server list into normalized URLs.
pub fn split_server_urls(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(normalize_url)
        .collect()
}

/// First non-loopback IPv4 address of this host.
pub(crate) fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(normalize_url("http://localhost:8080/"), "http://localhost:8080");
        assert_eq!(normalize_url("https://server"), "https://server");
        assert_eq!(normalize_url("  server:8080  "), "http://server:8080");
    }

    #[test]
    fn test_split_server_urls() {
        assert_eq!(
            split_server_urls("s1:8080, http://s2:8080 ,https://s3/"),
            vec!["http://s1:8080", "http://s2:8080", "https://s3"]
        );
        assert!(split_server_urls("").is_empty());
    }

    #[test]
    fn test_wire_namespace_suffix_rules() {
        let api = ApolloHttpApi::new().unwrap();
        assert_eq!(api.wire_namespace("application"), "application");

        let api = api.with_config_type("json");
        assert_eq!(api.wire_namespace("datasources"), "datasources.json");

        // `.properties` is never appended.
        let api = api.with_config_type("properties");
        assert_eq!(api.wire_namespace("application"), "application");
    }

    #[test]
    fn test_notifications_url_shape() {
        let mut url = parse_url(&normalize_url("localhost:8080")).unwrap();
        with_path_segments(&mut url, &["notifications", "v2"]).unwrap();
        url.query_pairs_mut()
            .append_pair("appId", "app")
            .append_pair("cluster", "default")
            .append_pair(
                "notifications",
                &serde_json::to_string(&[Notification::new("application", -1)]).unwrap(),
            );

        let uri = request_uri(&url);
        assert!(uri.starts_with("/notifications/v2?appId=app&cluster=default&notifications="));
        // The JSON array travels percent-escaped.
        assert!(uri.contains("%22namespaceName%22"));
        assert!(!uri.contains('{'));
    }

    #[test]
    fn test_configs_url_keeps_server_prefix() {
        let mut url = parse_url(&normalize_url("http://server:8080/proxy")).unwrap();
        with_path_segments(&mut url, &["configs", "app", "default", "application"]).unwrap();
        url.query_pairs_mut()
            .append_pair("releaseKey", "20181017110222")
            .append_pair("ip", "10.0.0.1");

        assert_eq!(
            request_uri(&url),
            "/proxy/configs/app/default/application?releaseKey=20181017110222&ip=10.0.0.1"
        );
    }

    #[test]
    fn test_meta_services_url_shape() {
        let mut url = parse_url(&normalize_url("apollo.meta")).unwrap();
        with_path_segments(&mut url, &["services", "config"]).unwrap();
        url.query_pairs_mut()
            .append_pair("id", "10.0.0.1")
            .append_pair("appId", "app");

        assert_eq!(request_uri(&url), "/services/config?id=10.0.0.1&appId=app");
    }

    #[test]
    fn test_local_ip_has_value() {
        assert!(!local_ip().is_empty());
    }
}
