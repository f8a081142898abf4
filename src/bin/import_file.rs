use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use chain_import::config::ImportConfig;
use chain_import::import::{
    ChannelBroadcaster, ImportCoordinator, ImportRequest, LogNotifier, SideEffects,
};
use chain_import::store::{ImportStore, MemoryStore, PgStore, run_migrations};

#[derive(Parser, Debug)]
#[command(
    name = "import_file",
    about = "Import a JSON batch of chain records into the database"
)]
struct Args {
    /// Path to a JSON import request (`{"domains": {...}}`).
    request: PathBuf,

    /// Validate and print the planned units without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Database to import into. Falls back to `DATABASE_URL`.
    #[arg(long)]
    database_url: Option<String>,

    /// Apply pending schema migrations before importing.
    #[arg(long)]
    migrate: bool,

    /// Units of one stage-group run at once.
    #[arg(long)]
    max_concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.request)?;
    let request: ImportRequest = match serde_json::from_str(&raw) {
        Ok(request) => request,
        Err(err) => {
            writeln!(
                io::stderr(),
                "error: {} is not a valid import request: {err}",
                args.request.display()
            )?;
            std::process::exit(1);
        }
    };

    let mut config = ImportConfig::from_env();
    if let Some(max_concurrency) = args.max_concurrency {
        config = config.with_max_concurrency(max_concurrency);
    }

    let store: Arc<dyn ImportStore> = if args.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        let database_url = match args.database_url {
            Some(url) => url,
            None => std::env::var("DATABASE_URL")?,
        };
        let store = PgStore::connect(&database_url, config.max_concurrency as u32 + 1).await?;
        if args.migrate {
            run_migrations(store.pool()).await?;
        }
        Arc::new(store)
    };

    let side_effects = SideEffects::spawn(
        config.side_effect_buffer,
        Arc::new(LogNotifier),
        Arc::new(ChannelBroadcaster::new(1)),
    );
    let coordinator = ImportCoordinator::new(store, config, side_effects)?;

    let output = if args.dry_run {
        coordinator
            .prepare(&request)
            .map(|plan| serde_json::to_string_pretty(&plan.summary()))
    } else {
        coordinator
            .import(&request)
            .await
            .map(|result| serde_json::to_string_pretty(&result))
    };

    match output {
        Ok(json) => {
            println!("{}", json?);
            Ok(())
        }
        Err(err) => {
            writeln!(io::stderr(), "error: {err}")?;
            std::process::exit(1);
        }
    }
}
