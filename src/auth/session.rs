//! Broker login/refresh flow producing the bearer credential the fabric
//! attaches to WebSocket handshakes.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

const LOGIN_PATH: &str = "/rest/auth/angelbroking/user/v1/loginByPassword";
const REFRESH_PATH: &str = "/rest/auth/angelbroking/jwt/v1/generateTokens";

/// Session credentials returned by the broker.
#[derive(Debug, Clone, Default)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Separate token some brokers require for market-data sockets.
    pub feed_token: String,
    /// Best-effort expiry; `None` when the response carried no TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionTokens {
    /// `Authorization` header value for WS handshakes and API calls.
    pub fn auth_header(&self) -> Option<String> {
        if self.access_token.is_empty() {
            None
        } else {
            Some(format!("Bearer {}", self.access_token))
        }
    }

    /// Unknown TTL is treated as non-expiring.
    pub fn is_expired(&self, skew: Duration) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(at) => {
                let skew = ChronoDuration::from_std(skew).unwrap_or(ChronoDuration::zero());
                Utc::now() + skew >= at
            }
            None => false,
        }
    }
}

/// HTTP client for the broker auth endpoints.
pub struct AuthClient {
    http: Client,
    base_url: String,
    api_key: String,
    client_code: String,
    password: String,
}

impl AuthClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        client_code: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build auth http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client_code: client_code.into(),
            password: password.into(),
        })
    }

    /// Password + TOTP login. Returns the full token set.
    pub async fn login(&self, totp_code: &str) -> Result<SessionTokens> {
        let payload = json!({
            "clientcode": self.client_code,
            "password": self.password,
            "totp": totp_code,
        });
        let body = self.post(LOGIN_PATH, &payload).await?;
        let tokens = parse_login_response(&body).context("login response rejected")?;
        info!(client = %self.client_code, "broker login succeeded");
        Ok(tokens)
    }

    /// Exchange a refresh token for a fresh access token; fields missing
    /// from the response retain their previous values.
    pub async fn refresh(&self, current: &SessionTokens) -> Result<SessionTokens> {
        if current.refresh_token.is_empty() {
            bail!("refresh called without a refresh token");
        }
        let payload = json!({ "refreshToken": current.refresh_token });
        let body = self.post(REFRESH_PATH, &payload).await?;
        let tokens =
            parse_refresh_response(&body, current).context("refresh response rejected")?;
        info!(client = %self.client_code, "broker token refresh succeeded");
        Ok(tokens)
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("X-PrivateKey", &self.api_key)
            .header("X-UserType", "USER")
            .header("X-SourceID", "WEB")
            .json(payload)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(%status, path, "auth endpoint returned error");
            bail!("POST {path} returned {status}: {body}");
        }
        Ok(body)
    }
}

/// Pull `data.jwtToken` / `data.refreshToken` / `data.feedToken` and a
/// best-effort TTL out of a login response body.
fn parse_login_response(body: &str) -> Result<SessionTokens> {
    let root: Value = serde_json::from_str(body).context("response is not json")?;
    let data = response_data(&root)?;

    let access_token = required_str(data, "jwtToken")?;
    let refresh_token = required_str(data, "refreshToken")?;
    let feed_token = data
        .get("feedToken")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(SessionTokens {
        access_token,
        refresh_token,
        feed_token,
        expires_at: ttl_to_expiry(data),
    })
}

/// Refresh responses may omit the refresh/feed tokens; keep the old ones.
fn parse_refresh_response(body: &str, current: &SessionTokens) -> Result<SessionTokens> {
    let root: Value = serde_json::from_str(body).context("response is not json")?;
    let data = response_data(&root)?;

    let access_token = required_str(data, "jwtToken")?;
    let refresh_token = data
        .get("refreshToken")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| current.refresh_token.clone());
    let feed_token = data
        .get("feedToken")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| current.feed_token.clone());

    Ok(SessionTokens {
        access_token,
        refresh_token,
        feed_token,
        expires_at: ttl_to_expiry(data).or(current.expires_at),
    })
}

fn response_data(root: &Value) -> Result<&Value> {
    root.get("data")
        .filter(|d| d.is_object())
        .ok_or_else(|| anyhow!("response missing data object"))
}

fn required_str(data: &Value, key: &str) -> Result<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("response missing {key}"))
}

fn ttl_to_expiry(data: &Value) -> Option<DateTime<Utc>> {
    let ttl = data
        .get("expiresIn")
        .and_then(Value::as_i64)
        .or_else(|| data.get("jwtTokenTTL").and_then(Value::as_i64))?;
    if ttl <= 0 {
        return None;
    }
    Some(Utc::now() + ChronoDuration::seconds(ttl))
}
