//! GitHub App installation tokens, minted from the app's private key and
//! cached process-wide per installation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use super::{ScmError, ScmResult};

/// Tokens are refreshed this long before GitHub expires them.
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(&self, installation_id: i64) -> ScmResult<InstallationToken>;
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Mints installation tokens by signing an app JWT (RS256) and exchanging it.
pub struct AppTokenMinter {
    http: reqwest::Client,
    api_url: String,
    app_id: i64,
    key: EncodingKey,
}

impl AppTokenMinter {
    pub fn new(http: reqwest::Client, api_url: &str, app_id: i64, private_key_pem: &str) -> ScmResult<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| ScmError::Unauthenticated(format!("invalid app private key: {e}")))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            app_id,
            key,
        })
    }

    fn app_jwt(&self) -> ScmResult<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 540,
            iss: self.app_id.to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| ScmError::Unauthenticated(format!("signing app token: {e}")))
    }
}

#[async_trait]
impl TokenMinter for AppTokenMinter {
    async fn mint(&self, installation_id: i64) -> ScmResult<InstallationToken> {
        let jwt = self.app_jwt()?;
        let url = format!("{}/app/installations/{installation_id}/access_tokens", self.api_url);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", super::client::USER_AGENT)
            .send()
            .await
            .map_err(|e| ScmError::Unauthenticated(format!("installation {installation_id}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(installation_id, "Installation token request failed: {} {}", status, text);
            return Err(ScmError::Unauthenticated(format!(
                "installation {installation_id}: GitHub returned {status}"
            )));
        }

        let body: AccessTokenResponse = resp
            .json()
            .await
            .map_err(|e| ScmError::Unauthenticated(format!("installation {installation_id}: {e}")))?;

        tracing::debug!(installation_id, expires_at = %body.expires_at, "Minted installation token");
        Ok(InstallationToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }
}

/// Process-wide installation token cache. Refresh is single-flight per
/// installation; concurrent callers wait on the in-flight mint.
pub struct InstallationTokens {
    minter: Arc<dyn TokenMinter>,
    cache: RwLock<HashMap<i64, InstallationToken>>,
    flights: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstallationTokens {
    pub fn new(minter: Arc<dyn TokenMinter>) -> Self {
        Self {
            minter,
            cache: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// A token valid for at least the refresh margin.
    pub async fn token(&self, installation_id: i64) -> ScmResult<String> {
        if let Some(token) = self.cached(installation_id) {
            return Ok(token);
        }

        let flight = self.flight(installation_id);
        let _guard = flight.lock().await;

        if let Some(token) = self.cached(installation_id) {
            return Ok(token);
        }

        let minted = self.minter.mint(installation_id).await?;
        let token = minted.token.clone();
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(installation_id, minted);
        Ok(token)
    }

    /// Drop the cached token so the next call mints a fresh one.
    pub fn invalidate(&self, installation_id: i64) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&installation_id);
    }

    fn cached(&self, installation_id: i64) -> Option<String> {
        let cutoff = Utc::now() + Duration::seconds(REFRESH_MARGIN_SECS);
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&installation_id)
            .filter(|t| t.expires_at > cutoff)
            .map(|t| t.token.clone())
    }

    fn flight(&self, installation_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.flights
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(installation_id)
            .or_default()
            .clone()
    }
}
