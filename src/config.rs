//! Configuration: JSON file with serde defaults, plus `TICKFABRIC_*`
//! environment overrides for deployment knobs.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    pub api_key: String,
    pub client_code: String,
    pub password: String,
    pub totp_secret: String,
    /// Raw instrument tokens to subscribe (e.g. `"26000"`).
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default = "default_auth_base_url")]
    pub auth_base_url: String,
    #[serde(default = "default_wss_url")]
    pub wss_url: String,
    #[serde(default = "default_token_prefix")]
    pub token_prefix: String,
    #[serde(default = "default_max_tokens_per_conn")]
    pub max_tokens_per_conn: usize,
    #[serde(default = "default_subscribe_batch_size")]
    pub subscribe_batch_size: usize,
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Extra handshake headers sent on every shard connection.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_auth_base_url() -> String {
    "https://apiconnect.angelone.in".to_string()
}

fn default_wss_url() -> String {
    "wss://smartapisocket.angelone.in/smart-stream".to_string()
}

fn default_token_prefix() -> String {
    "nse_cm|".to_string()
}

fn default_max_tokens_per_conn() -> usize {
    800
}

fn default_subscribe_batch_size() -> usize {
    100
}

fn default_verify_peer() -> bool {
    true
}

impl FabricConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("config file not found: {}", path.display()))?;
        let mut cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("malformed config file: {}", path.display()))?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Environment overrides win over file values.
    fn apply_env(&mut self) {
        if let Ok(v) = env::var("TICKFABRIC_WSS_URL") {
            self.wss_url = v;
        }
        if let Ok(v) = env::var("TICKFABRIC_AUTH_BASE_URL") {
            self.auth_base_url = v;
        }
        if let Ok(v) = env::var("TICKFABRIC_TOKEN_PREFIX") {
            self.token_prefix = v;
        }
        if let Ok(v) = env::var("TICKFABRIC_MAX_TOKENS_PER_CONN") {
            if let Ok(n) = v.parse() {
                self.max_tokens_per_conn = n;
            }
        }
        if let Ok(v) = env::var("TICKFABRIC_SUBSCRIBE_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.subscribe_batch_size = n;
            }
        }
        if let Ok(v) = env::var("TICKFABRIC_VERIFY_PEER") {
            self.verify_peer = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = env::var("TICKFABRIC_CA_FILE") {
            if !v.is_empty() {
                self.ca_file = Some(PathBuf::from(v));
            }
        }
    }
}
