//! Compile command - build a C++ file in the sandbox and run it.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Args;
use codepad_sandbox::{CompilationResult, CppCompiler};
use console::style;

use super::{Context, ToolchainFlags};

/// Arguments for the compile command.
#[derive(Args, Debug)]
pub struct CompileArgs {
    /// C++ source file ("-" reads from stdin)
    pub file: PathBuf,

    /// Name of the source inside the sandbox (default: the file's name)
    #[arg(long)]
    pub filename: Option<String>,

    /// Compile only; do not run the program
    #[arg(long)]
    pub no_run: bool,

    /// Save the compiled program to this path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub toolchain: ToolchainFlags,
}

/// Run the compile command.
pub async fn run(args: CompileArgs, ctx: &Context) -> Result<ExitCode> {
    let source = read_source(&args.file)?;
    let options = ctx.sandbox_options(&args.toolchain)?;
    let filename = args
        .filename
        .clone()
        .or_else(|| source_name(&args.file))
        .unwrap_or_else(|| options.compiler.default_filename.clone());

    let compiler = CppCompiler::new(options);
    let result = if args.no_run {
        compiler.build(&source, &filename).await
    } else {
        compiler.compile_named(&source, &filename).await
    };

    if let Some(path) = &args.output
        && let Some(executable) = &result.executable
    {
        std::fs::write(path, executable)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result, &filename, ctx);
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_source(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read source from stdin")?;
        return Ok(source);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// The file's own name, unless reading stdin.
fn source_name(path: &Path) -> Option<String> {
    if path.as_os_str() == "-" {
        return None;
    }
    path.file_name().map(|name| name.to_string_lossy().to_string())
}

fn print_result(result: &CompilationResult, filename: &str, ctx: &Context) {
    let compiler_output = result.output.as_deref().unwrap_or_default();

    if !result.success {
        eprintln!("{} Compilation of {} failed", style("✗").red(), filename);
        if let Some(error) = &result.error {
            eprintln!("{}", error.trim_end());
        }
        return;
    }

    if ctx.verbose && !compiler_output.is_empty() {
        eprintln!("{}", style(compiler_output.trim_end()).dim());
    }

    if !result.has_executable() {
        eprintln!(
            "{} Compiled {} but no program was produced",
            style("⚠").yellow(),
            filename
        );
        if let Some(note) = &result.error {
            eprintln!("  {note}");
        }
        return;
    }

    let size = result.executable.as_ref().map_or(0, Vec::len);
    eprintln!(
        "{} Compiled {} ({} bytes)",
        style("✓").green(),
        filename,
        size
    );

    if let Some(stdout) = &result.execution_output {
        print!("{stdout}");
    }
    if let Some(stderr) = result.execution_error.as_deref().filter(|e| !e.is_empty()) {
        eprintln!("{}", style(stderr.trim_end()).red());
    }
}
