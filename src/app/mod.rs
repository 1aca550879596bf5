use crate::adb::AdbClient;
use crate::catalog::{Catalog, PopulationOptions};
use crate::channels::{ChannelContext, WorkerPool};
use crate::config::Config;
use crate::server::AppState;
use crate::session::SessionManager;
use crate::transcription::HttpTranscriber;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("config-init") {
        return handle_config_init();
    }

    let config = Config::load()?;

    if let Some(command) = args.first() {
        match command.as_str() {
            "discover" => return handle_discover(&config).await,
            "connect" => return handle_connect(&config, args.get(1)).await,
            other => return Err(format!("unknown command: {other}").into()),
        }
    }

    let adb = Arc::new(adb_client(&config));
    let session = Arc::new(session_manager(&config, &adb));
    let catalog = Arc::new(Catalog::open(config.catalog_path())?);
    tracing::info!(
        path = %catalog.path().display(),
        entries = catalog.len(),
        "catalog ready"
    );
    let transcriber = HttpTranscriber::new(
        config.transcription.endpoint.clone(),
        Duration::from_millis(config.transcription.timeout_ms),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        channels: ChannelContext {
            session,
            catalog,
            pool: WorkerPool::new(config.channels.worker_pool_size),
            threshold: config.resolver.threshold,
            gate_text_commands: config.session.gate_text_commands,
        },
        token: config.server.token.clone(),
        discovery: config.discovery.options()?,
        inspector: adb,
        transcriber: Arc::new(transcriber),
        population: PopulationOptions {
            work_dir: Path::new(&config.catalog.dir).join("apks"),
            deadline: Duration::from_secs(config.catalog.population_deadline_secs),
        },
        shutdown: shutdown_rx.clone(),
    });

    let addr: SocketAddr = config.bind_addr().parse()?;
    if config.server.token.is_none() {
        tracing::warn!("server.token is not set, all routes are open");
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown: ctrl-c");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                tracing::warn!(error = %err, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    });

    crate::server::start(addr, state, shutdown_rx).await
}

fn adb_client(config: &Config) -> AdbClient {
    AdbClient::new(
        &config.adb.binary,
        &config.adb.aapt_binary,
        Duration::from_millis(config.adb.command_timeout_ms),
    )
}

fn session_manager(config: &Config, adb: &Arc<AdbClient>) -> SessionManager {
    SessionManager::new(
        adb.clone(),
        adb.clone(),
        Duration::from_millis(config.session.poll_interval_ms),
        config.session.poll_attempts,
    )
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_discover(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let devices = crate::discovery::probe(&config.discovery.options()?).await?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn handle_connect(
    config: &Config,
    address: Option<&String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let address = address.ok_or("usage: connect <ip:port>")?;
    let adb = Arc::new(adb_client(config));
    let session = Arc::new(session_manager(config, &adb));
    let outcome = session.connect(address).await;
    println!("{}", serde_json::to_string_pretty(&outcome.to_response())?);
    if outcome.is_connected() {
        Ok(())
    } else {
        Err(outcome.message().into())
    }
}
