//! Command-line front end for the sandbox client.
//!
//! Runs single programs, answer checks and proof checks against a remote
//! sandbox, and grades whole manifest files in place.

mod cli;
mod config;
mod inputs;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandbox::core::types::Language;

use crate::config::{BatchOverrides, load_config};

#[derive(Parser)]
#[command(
    name = "grade",
    version,
    about = "Run code in a remote sandbox and grade model answers"
)]
struct Cli {
    /// Settings file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "grade.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a source file and print the result as JSON.
    Execute {
        file: PathBuf,
        /// `python` or `lean4`.
        #[arg(long, default_value = "python")]
        language: Language,
        #[arg(long, default_value_t = 10.0)]
        timeout: f64,
        #[arg(long, default_value_t = 1000)]
        max_output_chars: usize,
    },
    /// Check whether a predicted answer matches the expected one.
    Check {
        #[arg(long)]
        predicted: String,
        #[arg(long)]
        expected: String,
        /// Python file defining `math_equal`; overrides `batch.checker_path`.
        #[arg(long)]
        checker: Option<PathBuf>,
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Compile a lean proof and print its status.
    Prove {
        file: PathBuf,
        #[arg(long, default_value_t = 30.0)]
        timeout: f64,
    },
    /// Grade manifest files (or directories of them) in place.
    Batch {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        checker: Option<PathBuf>,
        #[arg(long)]
        parallelism: Option<usize>,
        #[arg(long)]
        window: Option<usize>,
        /// `natural_language` or `lean`.
        #[arg(long)]
        answer_format: Option<String>,
        /// Recheck records that already carry a verdict.
        #[arg(long)]
        ignore_cache: bool,
        /// Use each record's `predicted_answer` instead of extracting one.
        #[arg(long)]
        use_predicted_answer_key: bool,
    },
}

fn main() {
    sandbox::logging::init("info");
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    runtime.block_on(async {
        match cli.command {
            Command::Execute {
                file,
                language,
                timeout,
                max_output_chars,
            } => cli::execute(&config, &file, language, timeout, max_output_chars).await,
            Command::Check {
                predicted,
                expected,
                checker,
                timeout,
            } => cli::check(&config, &predicted, &expected, checker, timeout).await,
            Command::Prove { file, timeout } => cli::prove(&config, &file, timeout).await,
            Command::Batch {
                inputs,
                checker,
                parallelism,
                window,
                answer_format,
                ignore_cache,
                use_predicted_answer_key,
            } => {
                let overrides = BatchOverrides {
                    checker_path: checker,
                    parallelism,
                    window,
                    answer_format,
                    ignore_cache,
                    use_predicted_answer_key,
                };
                cli::batch(&config, &inputs, &overrides).await
            }
        }
    })
}
