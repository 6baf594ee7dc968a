//! Request signing for access-key protected Apollo servers

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;

pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_TIMESTAMP: &str = "Timestamp";

const DELIMITER: &str = "\n";

type HmacSha1 = Hmac<Sha1>;

/// Everything a signer may look at for one outbound request.
#[derive(Debug, Clone, Copy)]
pub struct SignatureContext<'a> {
    pub app_id: &'a str,
    /// Access key cached at client construction; empty disables signing.
    pub access_key: &'a str,
    /// Config server the request goes to.
    pub config_server_url: &'a str,
    /// Path and query of the request, relative to the server.
    pub request_uri: &'a str,
    /// Cluster of the request; empty for meta-server calls.
    pub cluster: &'a str,
}

/// Produces the auth headers for one request; replaceable for servers with
/// custom authentication schemes.
pub type SignatureFunc = fn(&SignatureContext<'_>) -> HashMap<String, String>;

/// The Apollo access-key scheme: HMAC-SHA1 over `timestamp \n pathAndQuery`,
/// base64-encoded into `Authorization: Apollo <appId>:<signature>`.
pub fn default_signature(ctx: &SignatureContext<'_>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if ctx.app_id.is_empty() || ctx.access_key.is_empty() {
        return headers;
    }

    let api_url = format!("{}{}", ctx.config_server_url, ctx.request_uri);
    let timestamp = unix_millis().to_string();
    let signature = sign(&timestamp, &path_and_query(&api_url), ctx.access_key);

    headers.insert(
        HEADER_AUTHORIZATION.to_string(),
        format!("Apollo {}:{}", ctx.app_id, signature),
    );
    headers.insert(HEADER_TIMESTAMP.to_string(), timestamp);
    headers
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn sign(timestamp: &str, url: &str, access_key: &str) -> String {
    let string_to_sign = format!("{}{}{}", timestamp, DELIMITER, url);
    hmac_sha1_base64(access_key.as_bytes(), string_to_sign.as_bytes())
}

fn hmac_sha1_base64(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any size");
    mac.update(data);
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Strip scheme and authority from an absolute URL, keeping path and query.
/// An input that does not parse as absolute is assumed to already be one.
pub(crate) fn path_and_query(uri: &str) -> String {
    match reqwest::Url::parse(uri) {
        Ok(url) => match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        },
        Err(_) => uri.to_string(),
    }
}
