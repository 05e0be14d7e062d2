use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "feedmirror",
    version,
    about = "Mirror profiles, posts, messages and stories with their media"
)]
pub struct Cli {
    /// Path to the TOML config file (default: ./feedmirror.toml)
    #[arg(short = 'c', long, env = "FEEDMIRROR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sync every configured profile and download new media
    Sync(SyncArgs),

    /// Show row counts, pending downloads and last scrape times
    Status,

    /// Check that every recorded media file exists in storage
    Verify,

    /// Copy a stored file (or a byte range of it) out of storage
    Export(ExportArgs),

    /// Apply pending database migrations and exit
    Migrate,

    /// Serve stored files over HTTP with range support
    Serve(ServeArgs),
}

#[derive(Args, Debug, Default)]
pub struct SyncArgs {
    /// Page through every collection instead of stopping at known items
    #[arg(long)]
    pub force_rescan: bool,

    /// Only sync these profile ids (repeatable)
    #[arg(long = "profile")]
    pub profiles: Vec<String>,

    #[arg(long)]
    pub skip_posts: bool,

    #[arg(long)]
    pub skip_messages: bool,

    #[arg(long)]
    pub skip_stories: bool,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Storage path, as recorded in the media table
    pub path: String,

    /// First byte to copy
    #[arg(long, default_value_t = 0)]
    pub start: u64,

    /// Number of bytes to copy (default: to the end)
    #[arg(long)]
    pub len: Option<u64>,

    /// Output file (default: stdout)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080", env = "FEEDMIRROR_LISTEN")]
    pub listen: SocketAddr,
}
