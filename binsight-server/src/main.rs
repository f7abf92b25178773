//! Binsight backend server
//!
//! Single process hosting the ingestion API, the tier-partitioned worker
//! pools, the payment webhook and the nightly janitor.

use binsight_server::analyzer::HttpAnalyzer;
use binsight_server::blob::FsBlobStore;
use binsight_server::db::jobs::JobStore;
use binsight_server::db::otps::OtpStore;
use binsight_server::janitor::{self, Janitor};
use binsight_server::queue::{self, TieredQueue};
use binsight_server::state::AppContext;
use binsight_server::{api, worker};
use binsight_common::config::Config;
use binsight_common::events::EventBus;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Binsight - metered binary-analysis backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host address to bind to (overrides environment configuration)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Port to bind to (overrides environment configuration)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Data directory (overrides environment configuration)
    #[arg(short, long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("binsight_server={log_level},binsight_common={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Binsight backend starting...");

    let mut config = Config::from_env()?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.blob.root = data_dir.join("blobs");
        config.data_dir = data_dir;
    }
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.data_dir)?;

    info!("Initializing database...");
    let db = binsight_common::db::init_database(&config.db_path()).await?;

    info!("Initializing blob store at {}...", config.blob.root.display());
    let blobs = Arc::new(FsBlobStore::new(&config.blob)?);

    let queue = TieredQueue::new(db.clone(), config.queue.clone());
    let events = EventBus::default();
    let janitor = Arc::new(Janitor::new(
        JobStore::new(db.clone()),
        OtpStore::new(db.clone()),
        queue.clone(),
        blobs.clone(),
        config.janitor.clone(),
    ));

    let ctx = AppContext::new(
        config.clone(),
        db,
        blobs,
        queue.clone(),
        events,
        janitor.clone(),
    );

    // Surface any balance-advanced-but-no-transaction drift before
    // taking traffic
    ctx.ledger.audit_all().await?;

    let analyzer = Arc::new(HttpAnalyzer::new(&config.analyzer)?);
    let cancel = CancellationToken::new();

    info!("Starting worker pools...");
    worker::spawn_worker_pools(ctx.worker_context(analyzer), cancel.clone());
    queue::spawn_stall_sweeper(queue, cancel.clone());
    janitor::spawn_schedule(janitor, config.janitor.hour, cancel.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let result = api::run(ctx, addr).await;

    cancel.cancel();
    result?;
    Ok(())
}
