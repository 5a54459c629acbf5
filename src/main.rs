use anyhow::Result;
use std::sync::Arc;
use tabload::access::{AccessControl, TableAllowList};
use tabload::db::Db;
use tabload::registry::{spawn_sweeper, Registry};
use tabload::server::HttpServer;
use tabload::store::StoreCache;
use tabload::{Config, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // RUST_LOG wins over the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.tabload.log_level.as_str()),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("verify");

    match command {
        "serve" => run_http_server(&config).await?,
        // Default: check config, registry and connections
        _ => run_verification(&config).await?,
    }

    Ok(())
}

/// Load the registry (with startup recovery) and build the orchestrator
async fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let registry = Arc::new(Registry::load(config.data_dir(), &config.ingest).await?);
    let stores = Arc::new(StoreCache::new(
        config.connections.clone(),
        config.ingest.store_cache_capacity,
    ));
    let access: Arc<dyn AccessControl> = Arc::new(TableAllowList::from_config(&config.access));
    Ok(Orchestrator::new(registry, stores, access, config.ingest.clone()))
}

/// Run the HTTP server and the background sweep
async fn run_http_server(config: &Config) -> Result<()> {
    log::info!("Starting tabload HTTP server v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Data directory: {}", config.data_dir().display());
    log::info!("{} connection(s) configured", config.connections.len());

    let orchestrator = build_orchestrator(config).await?;
    let _sweeper = spawn_sweeper(Arc::clone(orchestrator.registry()), config.ingest.clone());

    let server = HttpServer::new(config, orchestrator)?;
    server.run(config.http_server.port).await?;

    Ok(())
}

/// Verify that the config loads, the registry recovers and every connection opens
async fn run_verification(config: &Config) -> Result<()> {
    log::info!("Configuration loaded successfully");
    log::info!("Data directory: {}", config.data_dir().display());

    let orchestrator = build_orchestrator(config).await?;
    let (files, tasks) = orchestrator
        .registry()
        .read(|s| (s.files.len(), s.tasks.len()))
        .await;
    log::info!("✓ Registry: {} file(s), {} task(s)", files, tasks);

    let mut names: Vec<&String> = config.connections.keys().collect();
    names.sort();
    let mut failures = 0;
    for name in names {
        let db = Db::new(&config.connections[name]);
        let result = db
            .with_connection(|conn| {
                let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
                let tables: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )?;
                Ok((integrity, tables))
            })
            .await;

        match result {
            Ok((integrity, tables)) if integrity == "ok" => {
                log::info!("✓ Connection '{}': {} table(s)", name, tables);
            }
            Ok((integrity, _)) => {
                log::error!("Connection '{}' failed integrity check: {}", name, integrity);
                failures += 1;
            }
            Err(e) => {
                log::error!("Connection '{}' could not be opened: {}", name, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} connection(s) failed verification", failures);
    }
    log::info!("✓ Verification complete");
    Ok(())
}
