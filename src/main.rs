use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use housewarming::{
    blob::{BlobStore, DiskBlobStore, InlineBlobStore, UrlSigner},
    config::{BlobBackend, Cli, Command, Config},
    http::{AppState, build_router},
    pledge::{PledgeEngine, VenmoLinkBuilder},
    reconcile::{Reconciler, SyncMode},
    store::{RecordStore, local::LocalStore, remote::RemoteStore, sqlite::SqliteStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Init => init_data_dir(&cli.config).await,
    }
}

async fn init_data_dir(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    LocalStore::open(&config.data_dir)?;

    let db_path = config.database_path();
    let db = SqliteStore::open(&db_path)?;
    let funds = db.list_funds().await?;
    println!("database: {}", db_path.display());
    println!("funds: {}", funds.len());

    let mismatches = db.ledger_mismatches().await?;
    for m in &mismatches {
        warn!(
            fund_id = %m.fund_id,
            current = m.current,
            pledged = m.pledged,
            "fund total does not match its pledge log"
        );
    }
    if !mismatches.is_empty() {
        println!("ledger mismatches: {}", mismatches.len());
    }
    Ok(())
}

fn open_durable(config: &Config) -> Result<Option<Arc<dyn RecordStore>>> {
    if config.sync_mode == SyncMode::LocalOnly {
        return Ok(None);
    }
    let durable: Arc<dyn RecordStore> = match config.upstream_url() {
        Some(url) => Arc::new(RemoteStore::new(
            url,
            config.upstream_api_key(),
            config.upstream_timeout(),
        )?),
        None => Arc::new(SqliteStore::open(&config.database_path())?),
    };
    Ok(Some(durable))
}

async fn run_server(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;

    let fallback = Arc::new(LocalStore::open(&config.data_dir)?);
    let durable = open_durable(&config)?;

    let (blobs, disk_blobs): (Arc<dyn BlobStore>, _) = match config.blob_backend {
        BlobBackend::Inline => (Arc::new(InlineBlobStore) as Arc<dyn BlobStore>, None),
        BlobBackend::Disk => {
            if config.blob_signing_key.is_empty() {
                warn!("no blob signing key configured; signed urls will not survive a restart");
            }
            let disk = Arc::new(DiskBlobStore::new(
                &config.data_dir,
                config.blob_url_base(),
                UrlSigner::new(Some(&config.blob_signing_key)),
                config.signed_url_ttl(),
            ));
            (disk.clone() as Arc<dyn BlobStore>, Some(disk))
        }
    };

    let reconciler = Reconciler::new(config.sync_mode, durable.clone(), fallback, blobs)
        .with_seed_manifest(config.gallery_manifest.clone());
    let pledges = PledgeEngine::new(VenmoLinkBuilder::new(&config.venmo_username)?);

    let state = AppState {
        reconciler: Arc::new(reconciler),
        pledges: Arc::new(pledges),
        disk_blobs,
    };
    let app = build_router(&config, state).layer(TraceLayer::new_for_http());

    info!(
        host = %config.host,
        port = config.port,
        prefix = %config.api_prefix,
        sync_mode = %config.sync_mode,
        durable = durable.as_ref().map(|d| d.backend()).unwrap_or("none"),
        blob_backend = ?config.blob_backend,
        data_dir = %config.data_dir.display(),
        "starting housewarming"
    );
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
