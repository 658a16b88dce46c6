//! Persistent OAuth token store.
//!
//! One [`TokenStore`] is shared by every worker. All accessors take the
//! internal mutex; refresh itself is not serialized across callers — two
//! racing refreshes both succeed server-side and the last write wins, so
//! a caller that reads a stale token simply retries once.
//!
//! The token file lives at `<config>/galaxy_tokens.json`, is written via a
//! temp file + rename and tightened to 0600 unless --respect-umask was
//! given.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};

use crate::models::Token;
use crate::utils;

pub const DEFAULT_CLIENT_ID: &str = "46899977096215655";
pub const DEFAULT_CLIENT_SECRET: &str =
    "9d85c43b1482497dbbce61f6e4aa173a433796eeae2ca8c5f6129f2dc4de46d9";
pub const REDIRECT_URI: &str = "https://embed.gog.com/on_login_success?origin=client";
pub const AUTH_URL: &str = "https://auth.gog.com/auth";
pub const TOKEN_URL: &str = "https://auth.gog.com/token";

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct TokenStore {
    inner: Mutex<Token>,
    path: PathBuf,
    respect_umask: bool,
}

impl TokenStore {
    /// Loads the store from disk. A missing or unparsable file yields an
    /// empty (expired) token so callers go through the refresh/login path.
    pub fn load(path: &Path, respect_umask: bool) -> TokenStore {
        let mut token = std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Token>(&bytes).ok())
            .unwrap_or_default();

        // Old token files only carry expires_in; anchor it to the file
        // mtime so a fresh-enough token survives a restart.
        if token.expires_at.is_none() {
            if let Some(expires_in) = token.expires_in {
                let mtime = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                token.expires_at = Some(mtime + expires_in);
            }
        }

        TokenStore::from_token(token, path, respect_umask)
    }

    pub fn from_token(token: Token, path: &Path, respect_umask: bool) -> TokenStore {
        TokenStore {
            inner: Mutex::new(token),
            path: path.to_path_buf(),
            respect_umask,
        }
    }

    /// True when `now >= expires_at`. A token without `expires_at` counts
    /// as expired.
    pub fn is_expired(&self) -> bool {
        let token = self.inner.lock().unwrap();
        match token.expires_at {
            Some(at) => now_unix() >= at,
            None => true,
        }
    }

    /// Non-expired access token, or an error telling the caller to refresh.
    pub fn access_token(&self) -> Result<String> {
        if self.is_expired() {
            return Err(anyhow!("access token expired, refresh required"));
        }
        let token = self.inner.lock().unwrap();
        if token.access_token.is_empty() {
            return Err(anyhow!("not logged in"));
        }
        Ok(token.access_token.clone())
    }

    /// Access token regardless of freshness; for callers that only build
    /// optional Authorization headers.
    pub fn access_token_stale_ok(&self) -> Option<String> {
        let token = self.inner.lock().unwrap();
        if token.access_token.is_empty() {
            None
        } else {
            Some(token.access_token.clone())
        }
    }

    pub fn refresh_token(&self) -> String {
        self.inner.lock().unwrap().refresh_token.clone()
    }

    pub fn user_id(&self) -> String {
        self.inner.lock().unwrap().user_id.clone()
    }

    pub fn client_id(&self) -> String {
        let token = self.inner.lock().unwrap();
        if token.client_id.is_empty() {
            DEFAULT_CLIENT_ID.to_string()
        } else {
            token.client_id.clone()
        }
    }

    pub fn client_secret(&self) -> String {
        let token = self.inner.lock().unwrap();
        if token.client_secret.is_empty() {
            DEFAULT_CLIENT_SECRET.to_string()
        } else {
            token.client_secret.clone()
        }
    }

    /// Atomically replaces the stored token, computing `expires_at` when
    /// the server only sent `expires_in`, then persists.
    pub fn replace(&self, mut token: Token) {
        if token.expires_at.is_none() {
            let expires_in = token.expires_in.unwrap_or(3600);
            token.expires_at = Some(now_unix() + expires_in);
        }
        *self.inner.lock().unwrap() = token;
        if let Err(e) = self.save() {
            // Persisting is best effort; the in-memory token still works.
            log::warn!("failed to save token store: {}", e);
        }
    }

    /// Exchanges the refresh token for a fresh access token and stores it.
    pub async fn refresh(&self, client: &reqwest::Client, new_session: bool) -> Result<()> {
        let client_id = self.client_id();
        let client_secret = self.client_secret();
        self.refresh_with(client, &client_id, &client_secret, new_session)
            .await
    }

    /// Refresh against an explicit client pair. Cloud storage uses the
    /// per-product Galaxy client from the build manifest.
    pub async fn refresh_with(
        &self,
        client: &reqwest::Client,
        client_id: &str,
        client_secret: &str,
        new_session: bool,
    ) -> Result<()> {
        let client_id = client_id.to_string();
        let client_secret = client_secret.to_string();
        let refresh_token = self.refresh_token();
        if refresh_token.is_empty() {
            return Err(anyhow!("no refresh token, login required"));
        }

        let mut query = vec![
            ("client_id", client_id.clone()),
            ("client_secret", client_secret.clone()),
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];
        if !new_session {
            query.push(("without_new_session", "1".to_string()));
        }

        let response = client
            .get(TOKEN_URL)
            .query(&query)
            .send()
            .await
            .context("token refresh request failed")?
            .error_for_status()
            .context("token refresh rejected")?;

        let mut token: Token = response.json().await.context("invalid token response")?;
        token.client_id = client_id;
        token.client_secret = client_secret;
        self.replace(token);
        Ok(())
    }

    /// Exchanges an authorization code for the initial token pair.
    pub async fn exchange_code(&self, client: &reqwest::Client, code: &str) -> Result<()> {
        let client_id = DEFAULT_CLIENT_ID.to_string();
        let client_secret = DEFAULT_CLIENT_SECRET.to_string();
        let response = client
            .get(TOKEN_URL)
            .query(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", REDIRECT_URI),
            ])
            .send()
            .await
            .context("token exchange request failed")?
            .error_for_status()
            .context("token exchange rejected")?;

        let mut token: Token = response.json().await.context("invalid token response")?;
        token.client_id = client_id;
        token.client_secret = client_secret;
        self.replace(token);
        Ok(())
    }

    /// Writes the token file via temp + rename with restricted permissions.
    pub fn save(&self) -> Result<()> {
        let token = self.inner.lock().unwrap().clone();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(&token)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        utils::restrict_permissions(&tmp, self.respect_umask)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// URL the user opens in a browser to obtain an authorization code.
pub fn login_url() -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&layout=default&brand=gog",
        AUTH_URL,
        DEFAULT_CLIENT_ID,
        urlencode(REDIRECT_URI)
    )
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_at: Option<i64>) -> Token {
        Token {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            client_id: String::new(),
            client_secret: String::new(),
            expires_in: Some(3600),
            expires_at,
            user_id: "123".into(),
            session_id: String::new(),
        }
    }

    #[test]
    fn missing_file_is_expired() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::load(&tmp.path().join("tokens.json"), true);
        assert!(store.is_expired());
        assert!(store.access_token().is_err());
    }

    #[test]
    fn valid_token_is_served() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::from_token(
            token(Some(now_unix() + 100)),
            &tmp.path().join("tokens.json"),
            true,
        );
        assert!(!store.is_expired());
        assert_eq!(store.access_token().unwrap(), "access");
    }

    #[test]
    fn expired_token_is_refused_but_stale_read_works() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::from_token(
            token(Some(now_unix() - 1)),
            &tmp.path().join("tokens.json"),
            true,
        );
        assert!(store.is_expired());
        assert!(store.access_token().is_err());
        assert_eq!(store.access_token_stale_ok().unwrap(), "access");
    }

    #[test]
    fn replace_computes_expires_at_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tokens.json");
        let store = TokenStore::from_token(Token::default(), &path, true);
        store.replace(token(None));
        assert!(!store.is_expired());
        assert!(path.exists());

        let reloaded = TokenStore::load(&path, true);
        assert_eq!(reloaded.access_token().unwrap(), "access");
    }

    #[test]
    fn expires_in_anchored_to_file_mtime_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tokens.json");
        let mut t = token(None);
        t.expires_in = Some(3600);
        std::fs::write(&path, serde_json::to_vec(&t).unwrap()).unwrap();
        let store = TokenStore::load(&path, true);
        // mtime is "now", so mtime + 3600 is in the future
        assert!(!store.is_expired());
    }

    #[test]
    fn default_client_credentials_fill_in() {
        let tmp = tempfile::tempdir().unwrap();
        let store =
            TokenStore::from_token(Token::default(), &tmp.path().join("tokens.json"), true);
        assert_eq!(store.client_id(), DEFAULT_CLIENT_ID);
        assert_eq!(store.client_secret(), DEFAULT_CLIENT_SECRET);
    }

    #[test]
    fn login_url_escapes_redirect_uri() {
        let url = login_url();
        assert!(url.contains("redirect_uri=https%3A%2F%2Fembed.gog.com"));
        assert!(url.contains("response_type=code"));
    }
}
