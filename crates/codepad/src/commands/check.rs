//! Check command - load the toolchain and report readiness.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use codepad_sandbox::{CppCompiler, ToolchainInfo};
use console::style;
use serde::Serialize;

use super::{Context, ToolchainFlags};

/// Arguments for the check command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Seconds to wait for the toolchain to load
    #[arg(long, default_value_t = 60)]
    pub wait: u64,

    #[command(flatten)]
    pub toolchain: ToolchainFlags,
}

#[derive(Serialize)]
struct CheckReport<'a> {
    ready: bool,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    toolchain: Option<&'a ToolchainInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Run the check command.
pub async fn run(args: CheckArgs, ctx: &Context) -> Result<ExitCode> {
    let options = ctx.sandbox_options(&args.toolchain)?;
    let shared = options.toolchain.shared_runtime.clone();
    let driver = options.toolchain.driver.clone();

    let compiler = CppCompiler::new(options);
    let waited = compiler.wait_ready(Duration::from_secs(args.wait)).await;

    let report = CheckReport {
        ready: waited.is_ok(),
        state: compiler.state().to_string(),
        toolchain: compiler.info(),
        error: waited.as_ref().err().map(ToString::to_string),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let Some(info) = report.toolchain {
        println!("{} Toolchain ready", style("✓").green());
        println!("  factory:        {}", info.factory);
        println!("  shared runtime: {shared}");
        println!("    sha256:       {}", info.shared_runtime_sha256);
        println!("  driver:         {driver}");
        println!("    sha256:       {}", info.driver_sha256);
    } else {
        eprintln!("{} Toolchain not usable ({})", style("✗").red(), report.state);
        if let Some(error) = &report.error {
            eprintln!("  {error}");
        }
    }

    Ok(if report.ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
