use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use lakesync::config;
use lakesync::db::{self, SqliteStore};
use lakesync::model::{format_timestamp, ResourceType};
use lakesync::store::{EnrichedStore, RawStore};

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Restrict watermarks to one scope (board or project id)
    #[arg(long)]
    scope: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);

    println!("{:<22} {:>8} {:>10}  watermark", "resource", "raw", "canonical");
    for resource in ResourceType::ALL {
        let raw = RawStore::count(&store, resource).await?;
        let canonical = EnrichedStore::count(&store, resource).await?;
        let watermark = store
            .find_max_updated(resource, args.scope)
            .await?
            .map(|ts| format_timestamp(&ts))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<22} {:>8} {:>10}  {}", resource.as_str(), raw, canonical, watermark);
    }
    Ok(())
}
