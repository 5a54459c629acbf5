use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tabload::access::{AccessControl, Caller, TableAllowList};
use tabload::ingest::DuplicateMode;
use tabload::registry::{NewUpload, Registry, TaskStatus};
use tabload::store::StoreCache;
use tabload::{Config, Orchestrator, ProcessRequest};

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Load a CSV or spreadsheet file into a table of a configured connection")]
struct Args {
    /// File to ingest (.csv, .tsv, .txt, .xlsx, .xls, .ods)
    #[arg(short, long)]
    file: PathBuf,

    /// Target table
    #[arg(short, long)]
    table: String,

    /// Connection name from the config (defaults to the first configured one)
    #[arg(short, long)]
    connection: Option<String>,

    /// Database name, defaults to the connection name
    #[arg(short, long)]
    database: Option<String>,

    /// Duplicate handling: skip, update or error
    #[arg(short, long, default_value = "skip")]
    mode: String,

    /// Comma-separated identity fields (defaults to the table's primary key)
    #[arg(short, long, value_delimiter = ',')]
    identity: Vec<String>,

    /// User recorded as uploader and task owner
    #[arg(short, long, default_value = "cli")]
    user: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();

    let args = Args::parse();
    let mode: DuplicateMode = args.mode.parse()?;

    let config = Config::load()?;
    log::info!("Configuration loaded successfully");

    let connection = match args.connection {
        Some(name) => name,
        None => {
            let mut names: Vec<&String> = config.connections.keys().collect();
            names.sort();
            names
                .first()
                .map(|n| n.to_string())
                .ok_or_else(|| anyhow::anyhow!("no connections configured"))?
        }
    };

    let registry = Arc::new(Registry::load(config.data_dir(), &config.ingest).await?);
    let stores = Arc::new(StoreCache::new(
        config.connections.clone(),
        config.ingest.store_cache_capacity,
    ));
    let access: Arc<dyn AccessControl> = Arc::new(TableAllowList::from_config(&config.access));
    let orchestrator = Orchestrator::new(Arc::clone(&registry), stores, access, config.ingest.clone());

    let bytes = std::fs::read(&args.file)?;
    let original_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.file.display().to_string());

    // The operator running the binary already has filesystem access to the target
    let caller = Caller::new(args.user.clone(), true);

    let start = Instant::now();
    let file = registry
        .store_upload(
            NewUpload {
                original_name,
                mime_hint: None,
                uploaded_by: args.user,
                connection: Some(connection.clone()),
                database: args.database.clone(),
                table: Some(args.table.clone()),
            },
            &bytes,
        )
        .await?;

    let request = ProcessRequest {
        connection: Some(connection),
        database: args.database,
        table: Some(args.table),
        mode,
        identity_fields: args.identity,
    };
    let task = orchestrator.run_to_completion(&file.id, request, &caller).await?;

    log::info!(
        "Ingestion finished in {:.2}s: {} inserted, {} updated, {} skipped of {} rows",
        start.elapsed().as_secs_f64(),
        task.inserted_rows,
        task.updated_rows,
        task.skipped_rows,
        task.total_rows
    );
    println!("{}", serde_json::to_string_pretty(&task)?);

    if task.status == TaskStatus::Error {
        anyhow::bail!(
            "ingestion failed: {}",
            task.fatal_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
