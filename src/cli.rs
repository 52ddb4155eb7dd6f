use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::config::{HeapSize, IsolationMode};

/// Precompiles script packs into loadable archives.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Verbosity:
    /// -v -> Debug
    /// -vv -> Trace
    /// -q -> Warn
    /// -qq -> Error
    /// -qqq -> Off
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Compile every script in a batch manifest
    Build(BuildArgs),

    /// Internal: serve compile requests as a forked worker daemon
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Args, Clone)]
pub struct BuildArgs {
    /// Path to the batch manifest
    #[arg(short, long)]
    pub manifest: PathBuf,

    /// Override the worker pool cap from the manifest
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Override the batch timeout (seconds) from the manifest
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Override the isolation mode from the manifest
    #[arg(long, value_enum)]
    pub isolation: Option<IsolationMode>,

    /// Override the forked worker heap cap, e.g. 512M
    #[arg(long)]
    pub max_heap: Option<HeapSize>,

    /// Compile every script even when marked unchanged
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Debug, Args, Clone)]
pub struct WorkerArgs {
    /// Path to the compiler executable resolved by the parent process
    #[arg(long)]
    pub compiler: PathBuf,
}
