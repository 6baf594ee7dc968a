//! Apollo wire models
//!
//! These types match the Apollo Config Service API response formats for
//! the notification, config and meta-server endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespace used by `get` when neither the call nor the client options name one.
pub const DEFAULT_NAMESPACE: &str = "application";

/// Content type that is never appended to a namespace on the wire.
pub const DEFAULT_CONFIG_TYPE: &str = "properties";

/// Notification id meaning "unknown"; the server answers a long poll carrying
/// it as soon as any id exists for the namespace.
pub const DEFAULT_NOTIFICATION_ID: i64 = -1;

/// Notification id stored for a namespace the server answered 404 for. Keeps
/// the namespace in the poll set so a later creation is observed.
pub const PENDING_NOTIFICATION_ID: i64 = 0;

/// The key/value payload of one namespace at one release.
///
/// Values are whatever the server published: strings for `properties`
/// namespaces, possibly nested JSON for `json` ones. An ordered map keeps
/// backup files and change sets deterministic.
pub type Configurations = BTreeMap<String, Value>;

/// One entry of the long-poll protocol: the last notification id known
/// for a namespace, or the server's newer one in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub namespace_name: String,
    pub notification_id: i64,
}

impl Notification {
    pub fn new(namespace_name: impl Into<String>, notification_id: i64) -> Self {
        Self {
            namespace_name: namespace_name.into(),
            notification_id,
        }
    }
}

/// Response of the `/configs/{appId}/{cluster}/{namespace}` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApolloConfig {
    pub app_id: String,
    pub cluster: String,
    pub namespace_name: String,
    pub configurations: Configurations,
    pub release_key: String,
}

/// One config-server instance as reported by the meta server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigServer {
    pub app_name: String,
    pub instance_id: String,
    pub homepage_url: String,
}

/// Coerce a configuration value to the string form `get` returns.
///
/// Strings pass through, numbers and booleans render as written; null and
/// composite values have no string form and yield the empty string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_wire_names() {
        let n = Notification::new("application", 107);
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(json, r#"{"namespaceName":"application","notificationId":107}"#);
    }

    #[test]
    fn test_apollo_config_deserialization() {
        let body = r#"{
            "appId": "app1",
            "cluster": "default",
            "namespaceName": "application",
            "configurations": {"timeout": "100"},
            "releaseKey": "20181017110222-5ce3b2da895720e8"
        }"#;
        let config: ApolloConfig = serde_json::from_str(body).unwrap();
        assert_eq!(config.app_id, "app1");
        assert_eq!(config.release_key, "20181017110222-5ce3b2da895720e8");
        assert_eq!(config.configurations.get("timeout"), Some(&json!("100")));
    }

    #[test]
    fn test_config_server_deserialization() {
        let body = r#"[{"appName":"APOLLO-CONFIGSERVICE","instanceId":"i-1","homepageUrl":"http://10.0.0.1:8080/"}]"#;
        let servers: Vec<ConfigServer> = serde_json::from_str(body).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].homepage_url, "http://10.0.0.1:8080/");
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&json!("foo")), "foo");
        assert_eq!(value_to_string(&json!(100)), "100");
        assert_eq!(value_to_string(&json!(1.5)), "1.5");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!({"a": 1})), "");
        assert_eq!(value_to_string(&json!([1, 2])), "");
    }
}
