//! Headless fabric runner: authenticate, start the sharded feed, and log
//! store contents on an interval until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickfabric::auth::{AuthClient, Totp};
use tickfabric::feed::{LtpStore, ShardManager, ShardOptions, TickParser};
use tickfabric::FabricConfig;

const SNAPSHOT_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickfabric=info,ltp_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("TICKFABRIC_CONFIG").unwrap_or_else(|_| "tickfabric.json".to_string());
    let cfg = FabricConfig::load(&config_path)?;
    info!(
        config = %config_path,
        tokens = cfg.tokens.len(),
        wss_url = %cfg.wss_url,
        "configuration loaded"
    );

    let totp = Totp::new(&cfg.totp_secret).context("totp secret rejected")?;
    let auth = AuthClient::new(
        &cfg.auth_base_url,
        &cfg.api_key,
        &cfg.client_code,
        &cfg.password,
    )?;
    let tokens = auth.login(&totp.now()).await.context("broker login failed")?;

    let parser = Arc::new(TickParser::new(cfg.token_prefix.clone()));
    let store = Arc::new(LtpStore::new());
    let manager = ShardManager::new(
        parser,
        store.clone(),
        ShardOptions {
            wss_url: cfg.wss_url.clone(),
            max_tokens_per_conn: cfg.max_tokens_per_conn,
            subscribe_batch_size: cfg.subscribe_batch_size,
            verify_peer: cfg.verify_peer,
            ca_file: cfg.ca_file.clone(),
            token_prefix: cfg.token_prefix.clone(),
            headers: cfg.headers.clone(),
        },
    );

    manager.set_tokens(cfg.tokens.clone());
    if let Some(header) = tokens.auth_header() {
        manager.set_access_token(header);
    } else {
        warn!("login yielded no access token; connecting unauthenticated");
    }
    manager.start()?;
    info!(workers = manager.num_workers(), "fabric running");

    let mut ticker = tokio::time::interval(SNAPSHOT_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = store.snapshot();
                let mut sample: Vec<_> = snapshot.iter().take(5).collect();
                sample.sort_by(|a, b| a.0.cmp(b.0));
                info!(
                    instruments = snapshot.len(),
                    sample = ?sample
                        .iter()
                        .map(|(t, l)| format!("{t}={:.2}", l.price))
                        .collect::<Vec<_>>(),
                    "ltp snapshot"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    manager.stop();
    info!(instruments = store.len(), "fabric stopped");
    Ok(())
}
