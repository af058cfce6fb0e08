//! Crucible — a sandboxed JavaScript evaluation server.
//!
//! Evaluates untrusted snippets over a connection-per-request TCP protocol,
//! with per-request CPU and memory budgets enforced by `crucible-sandbox`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use crucible_config::CrucibleConfig;
use crucible_sandbox::{Platform, SandboxConfig};
use crucible_server::{Server, ServerConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 1101;

/// Command-line flags. Flags beat config-file values; defaults apply last.
#[derive(Debug, Parser)]
#[command(
    name = "crucible",
    version,
    about = "Sandboxed JavaScript evaluation server"
)]
struct Cli {
    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Number of worker threads (defaults to hardware concurrency).
    #[arg(long)]
    threads: Option<usize>,

    /// Path to a crucible.toml config file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Apply config-file overrides on top of the built-in sandbox defaults.
fn build_sandbox_config(overrides: &crucible_config::SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(mb) = overrides.max_heap_mb {
        config.max_heap_size = mb * 1024 * 1024;
    }
    if let Some(ms) = overrides.default_timeout_ms {
        config.default_timeout_ms = ms;
    }
    config
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn main() -> Result<()> {
    // The protocol fixes the exit codes: help is 1, fatal is non-zero.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) if error.kind() == ErrorKind::DisplayHelp => {
            let _ = error.print();
            std::process::exit(1);
        }
        Err(error) => error.exit(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match cli.config.clone().or_else(crucible_config::find_config_file) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            CrucibleConfig::from_file(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => CrucibleConfig::default(),
    };

    let port = cli.port.or(config.server.port).unwrap_or(DEFAULT_PORT);
    let threads = cli
        .threads
        .or(config.server.threads)
        .unwrap_or_else(default_threads);
    let sandbox = build_sandbox_config(&config.sandbox);

    // V8 comes up before any worker exists and outlives them all.
    let _platform = Platform::new().context("initialize V8")?;

    let server = Server::bind(ServerConfig {
        port,
        threads,
        sandbox,
    })
    .context("bind listeners")?;

    server.run().context("serve")?;
    Ok(())
}
