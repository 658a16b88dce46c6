//! Legacy downloader endpoints, signed with OAuth 1.0a HMAC-SHA1.
//!
//! One endpoint family (api.gog.com/downloader2) predates the OAuth 2
//! flow and still expects request-URL signing with a consumer key pair
//! and a per-user token/secret. Only URL-query signing with GET is
//! needed; header-based signing never occurs in this protocol.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;

use crate::http::HttpClient;

pub const CONSUMER_KEY: &str = "1f444d14ea8ec776585524a33f6ecc1c413ed4a5";
pub const CONSUMER_SECRET: &str = "20d175147f9db9a10fc0584aa128090217b9cf88";

const STATUS_URL: &str = "https://api.gog.com/downloader2/status/stable/";

/// Endpoint map fetched from the status document. Every URL gets a
/// trailing slash appended, matching the service's routing.
#[derive(Clone, Debug, Default)]
pub struct LegacyConfig {
    pub get_installer_link: String,
    pub get_extra_link: String,
}

pub struct LegacyApi {
    http: HttpClient,
    config: LegacyConfig,
    oauth_token: String,
    oauth_secret: String,
}

impl LegacyApi {
    pub fn new(http: HttpClient, oauth_token: String, oauth_secret: String) -> LegacyApi {
        LegacyApi {
            http,
            config: LegacyConfig::default(),
            oauth_token,
            oauth_secret,
        }
    }

    /// Fetches the endpoint map. Must run before any other call.
    pub async fn init(&mut self) -> Result<()> {
        let json = self.http.get_json(STATUS_URL, None).await?;
        let config = json
            .get("config")
            .ok_or_else(|| anyhow!("status document without config"))?;
        let field = |name: &str| {
            config
                .get(name)
                .and_then(Value::as_str)
                .map(|s| format!("{}/", s))
                .unwrap_or_default()
        };
        self.config = LegacyConfig {
            get_installer_link: field("get_installer_link"),
            get_extra_link: field("get_extra_link"),
        };
        Ok(())
    }

    pub async fn installer_link(&self, game: &str, file_id: &str) -> Result<Value> {
        let url = format!("{}{}/{}/", self.config.get_installer_link, game, file_id);
        self.get_signed_json(&url).await
    }

    pub async fn extra_link(&self, game: &str, file_id: &str) -> Result<Value> {
        let url = format!("{}{}/{}/", self.config.get_extra_link, game, file_id);
        self.get_signed_json(&url).await
    }

    async fn get_signed_json(&self, url: &str) -> Result<Value> {
        let signed = sign_url(
            url,
            CONSUMER_KEY,
            CONSUMER_SECRET,
            &self.oauth_token,
            &self.oauth_secret,
            &nonce(),
            timestamp(),
        );
        Ok(self.http.get_json(&signed, None).await?)
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn nonce() -> String {
    // sub-second uniqueness is enough for this endpoint family
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:x}{:x}", timestamp(), nanos)
}

/// RFC 5849 percent encoding: unreserved characters only.
fn oauth_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Signs a GET request URL, returning the URL with the oauth_* query
/// parameters appended. Deterministic given nonce and timestamp.
pub fn sign_url(
    url: &str,
    consumer_key: &str,
    consumer_secret: &str,
    token: &str,
    token_secret: &str,
    nonce: &str,
    timestamp: u64,
) -> String {
    let (base_url, existing_query) = match url.split_once('?') {
        Some((b, q)) => (b, q),
        None => (url, ""),
    };

    // parameters sorted by encoded name/value pairs
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    for pair in existing_query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(oauth_encode(k), oauth_encode(v));
    }
    params.insert("oauth_consumer_key".into(), oauth_encode(consumer_key));
    params.insert("oauth_nonce".into(), oauth_encode(nonce));
    params.insert("oauth_signature_method".into(), "HMAC-SHA1".into());
    params.insert("oauth_timestamp".into(), timestamp.to_string());
    if !token.is_empty() {
        params.insert("oauth_token".into(), oauth_encode(token));
    }
    params.insert("oauth_version".into(), "1.0".into());

    let param_string = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let base_string = format!(
        "GET&{}&{}",
        oauth_encode(base_url),
        oauth_encode(&param_string)
    );

    let signing_key = format!(
        "{}&{}",
        oauth_encode(consumer_secret),
        oauth_encode(token_secret)
    );

    let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(base_string.as_bytes());
    let signature = base64(&mac.finalize().into_bytes());

    let separator = if existing_query.is_empty() { '?' } else { '&' };
    format!(
        "{}{}{}&oauth_signature={}",
        url,
        separator,
        params
            .iter()
            .filter(|(k, _)| k.starts_with("oauth_"))
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&"),
        oauth_encode(&signature)
    )
}

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32;
        out.push(BASE64_ALPHABET[(n >> 18) as usize & 63] as char);
        out.push(BASE64_ALPHABET[(n >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(n >> 6) as usize & 63] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[n as usize & 63] as char
        } else {
            '='
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_known_vectors() {
        assert_eq!(base64(b""), "");
        assert_eq!(base64(b"f"), "Zg==");
        assert_eq!(base64(b"fo"), "Zm8=");
        assert_eq!(base64(b"foo"), "Zm9v");
        assert_eq!(base64(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn oauth_encoding_is_strict() {
        assert_eq!(oauth_encode("a b/c~d"), "a%20b%2Fc~d");
        assert_eq!(oauth_encode("ä"), "%C3%A4");
    }

    // Signature base string and result from RFC 5849 section 1.2 (with
    // the photos.example.net request).
    #[test]
    fn rfc5849_example_signature() {
        let signed = sign_url(
            "http://photos.example.net/photos?file=vacation.jpg&size=original",
            "dpf43f3p2l4k5l03",
            "kd94hf93k423kf44",
            "nnch734d00sl2jdk",
            "pfkkdhi9sl3r4s00",
            "kllo9940pd9333jh",
            1191242096,
        );
        assert!(signed.contains("oauth_signature=tR3%2BTy81lMeYAr%2FFid0kMTYa%2FWM%3D"));
        assert!(signed.contains("oauth_consumer_key=dpf43f3p2l4k5l03"));
        assert!(signed.contains("oauth_timestamp=1191242096"));
    }

    #[test]
    fn signing_preserves_original_query() {
        let signed = sign_url("https://h/api?a=1", "ck", "cs", "t", "ts", "n", 1);
        assert!(signed.starts_with("https://h/api?a=1&oauth_"));
        assert!(signed.contains("oauth_signature="));
    }

    #[test]
    fn signing_without_query_uses_question_mark() {
        let signed = sign_url("https://h/api/", "ck", "cs", "", "ts", "n", 1);
        assert!(signed.starts_with("https://h/api/?oauth_"));
        // no token parameter when the token is empty
        assert!(!signed.contains("oauth_token="));
    }
}
