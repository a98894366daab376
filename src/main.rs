use anyhow::Result;
use clap::{Parser, Subcommand};
use lakesync::collector::{CollectError, Pipeline};
use lakesync::config;
use lakesync::db::{self, SqliteStore};
use lakesync::model::ResourceType;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Collect one resource type for one scope (board or project id)
    Collect {
        #[arg(long)]
        resource: ResourceType,
        #[arg(long)]
        scope: Option<u64>,
        /// Ignore the stored watermark and fetch everything
        #[arg(long)]
        force_all: bool,
    },
    /// Map raw records of one resource type into canonical records
    Enrich {
        #[arg(long)]
        resource: ResourceType,
    },
    /// Print an example configuration file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);
    let pipeline = Pipeline::from_config(&cfg, Arc::new(store.clone()), Arc::new(store))?;

    match args.command {
        Command::Collect {
            resource,
            scope,
            force_all,
        } => match pipeline.collect(resource, scope, force_all).await {
            Ok(report) => info!(?report, "done"),
            Err(CollectError::PartialFanOut { report, failures }) => {
                for failure in &failures {
                    error!(parent = %failure.parent_id, error = %failure.error, "parent failed");
                }
                info!(?report, "partial");
                anyhow::bail!(
                    "{} of {} parents failed for {resource}",
                    failures.len(),
                    report.parents_visited
                );
            }
            Err(err) => return Err(err.into()),
        },
        Command::Enrich { resource } => {
            let report = pipeline.enrich(resource).await?;
            info!(?report, "done");
        }
        Command::ExampleConfig => {}
    }

    Ok(())
}
