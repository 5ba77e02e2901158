use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "objloader",
    about = "Stream a content-addressed object graph in dependency order",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load a root object and its whole closure
    Fetch(FetchArgs),
    /// Print the number of objects in a root's closure
    Count(SourceArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct SourceArgs {
    /// Object service base URL
    #[arg(long)]
    pub server: String,

    /// Stream holding the objects
    #[arg(long)]
    pub stream: String,

    /// Root object id
    #[arg(long)]
    pub object: String,

    /// Bearer token for the object service
    #[arg(long)]
    pub token: Option<String>,

    /// Persistent cache file; objects are kept in memory only when omitted
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Loader configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct FetchArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Print every object as an `id<TAB>json` line
    #[arg(long)]
    pub ndjson: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Start from this file instead of the defaults
    #[arg(long)]
    pub config: Option<PathBuf>,
}
