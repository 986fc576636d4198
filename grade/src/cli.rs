//! CLI command implementations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use sandbox::batch::BatchVerifier;
use sandbox::core::answer::AnswerFormat;
use sandbox::core::types::Language;
use sandbox::io::config::SandboxConfig;
use sandbox::io::transport::Transport;
use sandbox::oracle::Oracle;
use sandbox::protocol::{ExecutionProtocol, ExecutionRequest};
use serde_json::json;
use tracing::{debug, info};

use crate::config::{BatchOverrides, GradeConfig, apply_batch_overrides};
use crate::inputs::expand_inputs;

/// Open the transport off the async workers; an ssh tunnel polls until ready.
async fn connect(config: &SandboxConfig) -> Result<ExecutionProtocol> {
    let settings = config.clone();
    let transport = tokio::task::spawn_blocking(move || Transport::connect(&settings))
        .await
        .context("join transport setup")?
        .with_context(|| format!("connect to {} sandbox at {}", config.kind, config.host))?;
    debug!(endpoint = %transport.endpoint(), "sandbox transport ready");
    Ok(ExecutionProtocol::new(transport)?)
}

fn read_checker(path: Option<&Path>) -> Result<String> {
    let Some(path) = path else {
        bail!("answer checks need a checker: set batch.checker_path or pass --checker");
    };
    fs::read_to_string(path).with_context(|| format!("read checker {}", path.display()))
}

/// Run one file in the sandbox and print the result.
pub async fn execute(
    config: &GradeConfig,
    file: &Path,
    language: Language,
    timeout: f64,
    max_output_chars: usize,
) -> Result<()> {
    let code = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let protocol = connect(&config.sandbox).await?;
    let request = ExecutionRequest::new(code, language)
        .with_timeout(timeout)
        .with_max_output_chars(max_output_chars);
    let (result, _) = protocol.execute(&request, None).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Compare two answers with the checker and print the verdict.
pub async fn check(
    config: &GradeConfig,
    predicted: &str,
    expected: &str,
    checker: Option<PathBuf>,
    timeout: Option<f64>,
) -> Result<()> {
    let checker_path = checker.or_else(|| config.batch.checker_path.clone());
    let checker_source = read_checker(checker_path.as_deref())?;
    let oracle = Oracle::new(connect(&config.sandbox).await?, checker_source);
    info!(checker = oracle.checker_digest(), "checker loaded");

    let mut options = config.batch.check_options();
    if let Some(timeout) = timeout {
        options.timeout = timeout;
    }
    let check = oracle.is_output_correct(predicted, expected, options).await?;
    let verdict = json!({"is_correct": check.correct, "error_message": check.error_message});
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

/// Compile one lean proof and print its status.
pub async fn prove(config: &GradeConfig, file: &Path, timeout: f64) -> Result<()> {
    let proof = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let oracle = Oracle::new(connect(&config.sandbox).await?, String::new());
    let status = oracle.is_proof_correct(&proof, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&json!({"proof_status": status}))?);
    Ok(())
}

/// Verify every manifest under `inputs` in place.
pub async fn batch(config: &GradeConfig, inputs: &[PathBuf], overrides: &BatchOverrides) -> Result<()> {
    let settings = apply_batch_overrides(config.batch.clone(), overrides)?;
    let batch_config = settings.to_batch_config()?;
    let manifests = expand_inputs(inputs)?;

    let checker_source = match batch_config.answer_format {
        AnswerFormat::NaturalLanguage => read_checker(settings.checker_path.as_deref())?,
        AnswerFormat::Lean => String::new(),
    };
    let oracle = Oracle::new(connect(&config.sandbox).await?, checker_source);
    if batch_config.answer_format == AnswerFormat::NaturalLanguage {
        info!(checker = oracle.checker_digest(), "checker loaded");
    }
    info!(
        files = manifests.len(),
        parallelism = batch_config.parallelism,
        window = batch_config.window,
        use_cache = batch_config.use_cache,
        "starting batch"
    );

    let verifier = BatchVerifier::new(Arc::new(oracle), batch_config)?;
    let summary = verifier.run(&manifests).await.context("batch verification")?;
    println!(
        "batch: files={} rows={} dispatched={} cached={} deduplicated={} elapsed_secs={:.2}",
        summary.files,
        summary.rows,
        summary.dispatched,
        summary.cached,
        summary.deduplicated,
        summary.elapsed().num_milliseconds() as f64 / 1000.0
    );
    Ok(())
}
