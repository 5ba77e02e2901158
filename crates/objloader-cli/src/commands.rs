use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use futures::StreamExt;
use objloader::{
    BaseId, HttpObjectService, InMemoryObjectStore, LoadError, LoaderConfig, LogConfig,
    LogObjectStore, ObjectLoader, ObjectStore, ServiceEndpoint,
};
use tracing::{info, warn};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Fetch(args) => cmd_fetch(args).await,
        Command::Count(args) => cmd_count(args).await,
        Command::Config(args) => cmd_config(args),
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<LoaderConfig> {
    Ok(match path {
        Some(path) => LoaderConfig::load(path)?,
        None => LoaderConfig::default(),
    })
}

fn open_loader(args: &SourceArgs) -> anyhow::Result<ObjectLoader> {
    let config = load_config(args.config.as_deref())?;
    let mut endpoint = ServiceEndpoint::new(args.server.as_str(), args.stream.as_str());
    endpoint.token = args.token.clone();
    let service = Arc::new(HttpObjectService::new(endpoint)?);

    let store: Arc<dyn ObjectStore> = match &args.cache {
        Some(path) => {
            let store = LogObjectStore::open(path, LogConfig::default())?;
            info!(path = %path.display(), entries = store.len(), "cache opened");
            Arc::new(store)
        }
        None => Arc::new(InMemoryObjectStore::new()),
    };
    Ok(ObjectLoader::new(config, service, store)?)
}

async fn cmd_fetch(args: FetchArgs) -> anyhow::Result<()> {
    let loader = open_loader(&args.source)?;
    let root = BaseId::parse(&args.source.object)?;
    let started = Instant::now();

    let mut stream = loader.get_object_iterator(&root).await?;
    let mut failures: Vec<LoadError> = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(item) if args.ndjson => {
                println!("{}\t{}", item.base_id, serde_json::to_string(&item.base)?);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "object failed");
                failures.push(e);
            }
        }
    }
    loader.dispose_async().await;

    let stats = loader.stats();
    let elapsed = started.elapsed();
    let summary = format!(
        "{} objects in {:.2?} ({} cached, {} downloaded)",
        stats.emitted, elapsed, stats.cache_hits, stats.downloaded
    );
    if failures.is_empty() {
        eprintln!("{} {}", "✓".green().bold(), summary);
        return Ok(());
    }
    eprintln!("{} {}", "✗".red().bold(), summary);
    for e in &failures {
        eprintln!("  {}", e.to_string().red());
    }
    anyhow::bail!("{} objects failed to load", failures.len())
}

async fn cmd_count(args: SourceArgs) -> anyhow::Result<()> {
    let loader = open_loader(&args)?;
    let root = BaseId::parse(&args.object)?;
    let total = loader.total_object_count(&root).await?;
    println!("{}", total.to_string().bold());
    loader.dispose_async().await;
    Ok(())
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}
