use anyhow::{Context, Result};
use clap::Parser;
use loqa_link::sync::{FileArtifactSink, QuotaStorageProbe, SyncDependencies, SyncService};
use loqa_link::{create_router, AppState, Config, NatsTransport, SystemClock};
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "loqa-link")]
#[command(about = "Sync recordings and recording state with a paired device")]
struct Args {
    /// Config file (extension optional)
    #[arg(short, long, default_value = "config/loqa-link")]
    config: String,

    /// This device's ID on the link
    #[arg(long)]
    device_id: Option<String>,

    /// The paired device's ID
    #[arg(long)]
    peer_id: Option<String>,

    /// NATS server URL
    #[arg(long)]
    nats_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(&args.config)?;

    if let Some(device_id) = args.device_id {
        cfg.link.device_id = device_id;
    }
    if let Some(peer_id) = args.peer_id {
        cfg.link.peer_id = peer_id;
    }
    if let Some(nats_url) = args.nats_url {
        cfg.link.nats_url = nats_url;
    }

    info!("Loqa Link v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);
    info!("Device {} paired with {}", cfg.link.device_id, cfg.link.peer_id);

    let recordings_dir = cfg.storage.recordings_dir()?;
    info!("Recordings directory: {}", recordings_dir.display());

    let transport = NatsTransport::connect(
        &cfg.link.nats_url,
        cfg.link.device_id.clone(),
        cfg.link.peer_id.clone(),
        cfg.link.presence_interval(),
    )
    .await?;

    let sink = FileArtifactSink::new(&recordings_dir)?;
    let storage = QuotaStorageProbe::new(&recordings_dir, cfg.storage.quota_bytes);

    let sync = SyncService::spawn(
        cfg.sync.clone(),
        SyncDependencies {
            transport: Box::new(transport),
            sink: Some(Arc::new(sink)),
            storage: Arc::new(storage),
            clock: Arc::new(SystemClock),
        },
    )
    .await?;

    let app = create_router(AppState::new(sync.clone()));
    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
    info!("HTTP API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    if let Err(e) = sync.shutdown().await {
        warn!("Sync service did not shut down cleanly: {}", e);
    }

    Ok(())
}
