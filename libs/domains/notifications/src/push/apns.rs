//! Apple Push Notification service client (token-based auth over HTTP/2).
//!
//! Environment variables:
//! - `APP_BUNDLE_ID` - Topic the pushes are sent for
//! - `PRIVATE_KEY` - `.p8` signing key in PEM form (`\n` escapes allowed)
//! - `KEY_ID` - Key identifier from the developer account
//! - `TEAM_ID` - Team identifier, the token issuer

use crate::error::NotificationResult;
use async_trait::async_trait;
use chrono::Utc;
use core_config::{ConfigError, FromEnv, env_or_default, env_required};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub const PRODUCTION_ENDPOINT: &str = "https://api.push.apple.com";

/// Provider tokens are accepted for an hour; re-sign well before that.
const TOKEN_MAX_AGE_SECS: i64 = 50 * 60;

/// Pushes stay deliverable for this long after sending.
const EXPIRATION_HOURS: i64 = 25;

const COLLAPSE_ID: &str = "items_expiring";

#[derive(Debug, Clone)]
pub struct ApnsConfig {
    pub bundle_id: String,
    pub private_key: String,
    pub key_id: String,
    pub team_id: String,
    pub endpoint: String,
}

impl FromEnv for ApnsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bundle_id: env_required("APP_BUNDLE_ID")?,
            private_key: env_required("PRIVATE_KEY")?.replace("\\n", "\n"),
            key_id: env_required("KEY_ID")?,
            team_id: env_required("TEAM_ID")?,
            endpoint: env_or_default("APNS_ENDPOINT", PRODUCTION_ENDPOINT),
        })
    }
}

/// Outcome of one push as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResponse {
    pub status: u16,
    pub reason: Option<String>,
    pub apns_id: Option<String>,
}

impl PushResponse {
    pub fn sent(apns_id: impl Into<String>) -> Self {
        Self {
            status: 200,
            reason: None,
            apns_id: Some(apns_id.into()),
        }
    }

    pub fn rejected(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
            apns_id: None,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == 200
    }

    /// The token will never work again: 410, or 400 `BadDeviceToken`.
    pub fn is_token_inactive(&self) -> bool {
        match self.status {
            410 => true,
            400 => self.reason.as_deref() == Some("BadDeviceToken"),
            _ => false,
        }
    }
}

/// Sends one payload to one device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushClient: Send + Sync {
    async fn push(&self, device_token: &str, payload: Vec<u8>) -> NotificationResult<PushResponse>;
}

#[derive(Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

#[derive(Deserialize)]
struct ErrorBody {
    reason: String,
}

struct CachedToken {
    jwt: String,
    issued_at: i64,
}

pub struct ApnsClient {
    http: reqwest::Client,
    config: ApnsConfig,
    key: EncodingKey,
    token_cache: RwLock<Option<CachedToken>>,
}

impl ApnsClient {
    pub fn new(config: ApnsConfig) -> NotificationResult<Self> {
        let key = EncodingKey::from_ec_pem(config.private_key.as_bytes())?;
        // HTTP/2 is negotiated through ALPN on the TLS handshake.
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(600))
            .build()?;

        Ok(Self {
            http,
            config,
            key,
            token_cache: RwLock::new(None),
        })
    }

    /// Current provider token, re-signed when close to expiry.
    async fn provider_token(&self) -> NotificationResult<String> {
        let now = Utc::now().timestamp();
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if now - cached.issued_at < TOKEN_MAX_AGE_SECS {
                    return Ok(cached.jwt.clone());
                }
            }
        }

        let mut cache = self.token_cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref() {
            if now - cached.issued_at < TOKEN_MAX_AGE_SECS {
                return Ok(cached.jwt.clone());
            }
        }

        let jwt = self.sign(now)?;
        debug!(key_id = %self.config.key_id, "APNs provider token refreshed");
        *cache = Some(CachedToken {
            jwt: jwt.clone(),
            issued_at: now,
        });
        Ok(jwt)
    }

    fn sign(&self, issued_at: i64) -> NotificationResult<String> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.config.key_id.clone());
        let claims = ProviderClaims {
            iss: &self.config.team_id,
            iat: issued_at,
        };
        Ok(jsonwebtoken::encode(&header, &claims, &self.key)?)
    }
}

#[async_trait]
impl PushClient for ApnsClient {
    async fn push(&self, device_token: &str, payload: Vec<u8>) -> NotificationResult<PushResponse> {
        let token = self.provider_token().await?;
        let url = format!("{}/3/device/{}", self.config.endpoint, device_token);
        let expiration = Utc::now() + chrono::Duration::hours(EXPIRATION_HOURS);

        let response = self
            .http
            .post(url)
            .header("authorization", format!("bearer {}", token))
            .header("apns-topic", &self.config.bundle_id)
            .header("apns-push-type", "alert")
            .header("apns-collapse-id", COLLAPSE_ID)
            .header("apns-expiration", expiration.timestamp().to_string())
            .header("apns-priority", "10")
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let apns_id = response
            .headers()
            .get("apns-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let reason = if status == 200 {
            None
        } else {
            response.json::<ErrorBody>().await.ok().map(|body| body.reason)
        };

        Ok(PushResponse {
            status,
            reason,
            apns_id,
        })
    }
}
