use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use unicontact::config::{ConfigOverrides, ServerOverrides, StorageOverrides, UniContactConfig};
use unicontact::persistence::PersistentOpenOptions;
use unicontact::server::{self, AppState};
use unicontact::{ContactStore, MemoryStore, PersistentStore, Unicontact};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"unicontact_server - Contact identity reconciliation service

USAGE:
    unicontact_server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -l, --listen <ADDR>     Override listen address [default: 127.0.0.1:5000]
    -d, --data-dir <PATH>   Persist contacts in RocksDB at PATH (in-memory otherwise)
        --repair            Run RocksDB repair before opening the data dir
    -h, --help              Print help

ENVIRONMENT:
    UNICONTACT_CONFIG                Path to config file
    UNICONTACT_SERVER__LISTEN        Listen address
    UNICONTACT_STORAGE__DATA_DIR     Data directory
    PORT                             Replaces the port of the listen address
    RUST_LOG                         Log filter [default: info]

CONFIG FILE (unicontact.toml):
    [server]
    listen = "0.0.0.0:5000"
    request_timeout_ms = 5000

    [storage]
    data_dir = "/var/lib/unicontact"

    [reconcile]
    max_conflict_retries = 3
"#
    );
}

fn open_store(config: &UniContactConfig) -> anyhow::Result<Arc<dyn ContactStore>> {
    match &config.storage.data_dir {
        Some(path) => {
            let store = PersistentStore::open_with_options(
                path,
                PersistentOpenOptions {
                    repair: config.storage.repair,
                },
            )?;
            info!(path = %path.display(), contacts = store.len(), "opened persistent store");
            Ok(Arc::new(store))
        }
        None => {
            info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();
    let mut server_overrides = ServerOverrides::default();
    let mut storage_overrides = StorageOverrides::default();

    if let Some(listen) = parse_arg("--listen").or_else(|| parse_arg("-l")) {
        server_overrides.listen = Some(listen.parse()?);
    }
    if let Some(data_dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        storage_overrides.data_dir = Some(data_dir.into());
    }
    if has_flag("--repair") {
        storage_overrides.repair = Some(true);
    }

    if server_overrides.listen.is_some() {
        overrides.server = Some(server_overrides);
    }
    if storage_overrides.data_dir.is_some() || storage_overrides.repair.is_some() {
        overrides.storage = Some(storage_overrides);
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("UNICONTACT_CONFIG").ok());
    let config = UniContactConfig::load(config_path.as_deref(), overrides)?;

    let store = open_store(&config)?;
    if let Err(err) = store.ping() {
        error!(error = %err, "store is unreachable; refusing to start");
        return Err(err.into());
    }

    let unicontact = Unicontact::from_shared(store.clone(), config.reconcile.clone());
    let state = AppState::new(unicontact, config.server.request_timeout());

    let addr = config.server.listen_addr();
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "unicontact listening");

    server::serve(listener, state, shutdown_signal()).await?;

    store.flush()?;
    info!("store flushed; bye");
    Ok(())
}
