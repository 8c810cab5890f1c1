//! Command-line interface for inferbridge-rs.

use clap::Parser;
use std::path::PathBuf;

/// Drive an embedded inference server through one asynchronous request.
#[derive(Parser, Debug)]
#[command(name = "inferbridge-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Model repository absolute path.
    ///
    /// Required unless the config file sets `server.model_repository`.
    #[arg(short = 'r', long)]
    pub model_repository: Option<PathBuf>,

    /// Path to optional YAML config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Model to run (overrides the config file).
    #[arg(short, long)]
    pub model: Option<String>,

    /// Model version to wait for (overrides the config file).
    #[arg(long)]
    pub model_version: Option<i64>,
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
