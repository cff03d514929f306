//! Keyward Server - Main entry point.

mod routes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyward_crypto::MasterKey;
use keyward_kms::{Kms, KmsConfig, SystemClock};
use keyward_storage::{MemoryBackend, StorageBackend};
use keyward_storage_sqlite::SqliteBackend;

use crate::routes::AppState;

#[derive(Parser)]
#[command(name = "keyward-server")]
#[command(about = "Keyward - key management service")]
#[command(version)]
struct Cli {
    /// Enable development mode (generated master key, in-memory storage
    /// unless a data directory is given, root caller by default)
    #[arg(long, env = "KEYWARD_DEV_MODE")]
    dev: bool,

    /// Server bind address
    #[arg(long, default_value = "0.0.0.0:8300", env = "KEYWARD_BIND_ADDRESS")]
    bind: String,

    /// Directory holding the SQLite database
    #[arg(long, env = "KEYWARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Master key, 64 hex characters
    #[arg(long, env = "KEYWARD_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// Region served by this instance
    #[arg(long, default_value = "us-east-1", env = "KEYWARD_REGION")]
    region: String,

    /// Owning account id
    #[arg(long, default_value = "111122223333", env = "KEYWARD_ACCOUNT_ID")]
    account_id: String,

    /// ARN partition
    #[arg(long, default_value = "keyward", env = "KEYWARD_PARTITION")]
    partition: String,

    /// Seconds before a new grant is visible to id lookups
    #[arg(long, default_value_t = 180, env = "KEYWARD_GRANT_PROPAGATION_DELAY")]
    grant_propagation_delay: u64,

    /// Seconds between maintenance passes
    #[arg(long, default_value_t = 60, env = "KEYWARD_MAINTENANCE_INTERVAL")]
    maintenance_interval: u64,
}

impl Cli {
    fn kms_config(&self) -> KmsConfig {
        let mut config = KmsConfig::for_region(self.region.clone());
        config.account_id = self.account_id.clone();
        config.partition = self.partition.clone();
        config.grant_propagation_delay_secs = self.grant_propagation_delay;
        config.maintenance_interval_secs = self.maintenance_interval;
        config
    }

    fn master_key(&self) -> anyhow::Result<MasterKey> {
        match &self.master_key {
            Some(encoded) => {
                let bytes = hex::decode(encoded.trim()).context("master key is not valid hex")?;
                Ok(MasterKey::from_bytes(&bytes)?)
            },
            None if self.dev => {
                tracing::warn!("No master key given, generated an ephemeral one");
                Ok(MasterKey::generate())
            },
            None => bail!("--master-key (or KEYWARD_MASTER_KEY) is required outside dev mode"),
        }
    }

    async fn backend(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
        match &self.data_dir {
            Some(dir) => {
                let backend = SqliteBackend::open(dir, "keyward")
                    .await
                    .with_context(|| format!("failed to open storage in {}", dir.display()))?
                    .with_actor("keyward-server");
                tracing::info!("Storage: SQLite in {}", dir.display());
                Ok(Arc::new(backend))
            },
            None if self.dev => {
                tracing::info!("Storage: in-memory");
                Ok(Arc::new(MemoryBackend::new()))
            },
            None => bail!("--data-dir (or KEYWARD_DATA_DIR) is required outside dev mode"),
        }
    }
}

fn spawn_maintenance(kms: Arc<Kms>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = kms.run_maintenance().await {
                tracing::warn!(error = %err, "Maintenance pass failed");
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    tracing::info!("Starting Keyward server...");
    tracing::info!("Bind address: {}", cli.bind);

    if cli.dev {
        tracing::warn!("Development mode enabled - DO NOT USE IN PRODUCTION");
    }

    let config = cli.kms_config();
    let maintenance_every = config.maintenance_interval();
    let kms = Arc::new(Kms::new(
        config,
        cli.backend().await?,
        cli.master_key()?,
        Arc::new(SystemClock),
    )?);
    let maintenance = spawn_maintenance(kms.clone(), maintenance_every);

    let app = routes::router(AppState {
        kms,
        dev: cli.dev,
    });
    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;

    tracing::info!("Keyward server started successfully");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down...");
    maintenance.abort();

    Ok(())
}
