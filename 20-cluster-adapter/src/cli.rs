use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run several nodes over one in-memory log and exercise the adapter.
    Demo(DemoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Number of nodes sharing the log.
    #[arg(long, default_value_t = 3)]
    pub nodes: usize,

    /// JSON configuration file. Defaults are used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides the request timeout, in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Overrides the channel prefix.
    #[arg(long)]
    pub key: Option<String>,
}
