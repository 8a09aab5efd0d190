//! Codepad - compile and run C++ in a WebAssembly sandbox
//!
//! Main entry point for the Codepad CLI.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::prelude::*;

mod commands;

use commands::{check, compile, config};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Codepad - compile and run C++ in a WebAssembly sandbox
#[derive(Parser)]
#[command(name = "codepad")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Directory holding config.toml and logs/
    #[arg(long, global = true, env = "CODEPAD_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a C++ source file and run it
    Compile(compile::CompileArgs),

    /// Load the toolchain and report whether it is usable
    Check(check::CheckArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let loaded = codepad_config::load_config_with_options(None, cli.config_dir.as_deref())?;
    let logging = loaded.config.logging();

    // Console (human-readable, stderr) + optional rotating JSON file
    let filter = if cli.verbose {
        "codepad=debug,codepad_sandbox=debug,codepad_config=debug,info".to_string()
    } else {
        let level = &logging.level;
        format!("codepad={level},codepad_sandbox={level},codepad_config={level},warn")
    };

    let log_dir = cli
        .config_dir
        .clone()
        .or_else(codepad_config::xdg_config_dir)
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let (file_layer, _guard) = if logging.json_file {
        let file_appender = tracing_appender::rolling::daily(&log_dir, "codepad.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(tracing_subscriber::EnvFilter::new(
                "codepad=trace,codepad_sandbox=trace,codepad_config=trace,info",
            ));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(file_layer)
        .init();

    for warning in &loaded.warnings {
        warn!("{warning}");
    }

    // Create context for commands
    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        config_dir: cli.config_dir,
        config: loaded.config,
    };

    // Dispatch to command handlers
    match cli.command {
        Commands::Compile(args) => compile::run(args, &ctx).await,
        Commands::Check(args) => check::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await.map(|()| ExitCode::SUCCESS),
    }
}
