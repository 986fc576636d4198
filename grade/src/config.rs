//! `grade.toml` loading and command-line overrides.
//!
//! A missing file means defaults. The `[sandbox]` section is further
//! overridden by the `SANDBOX_*` environment variables.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sandbox::batch::BatchConfig;
use sandbox::core::answer::{AnswerFormat, AnswerSource, DEFAULT_EXTRACT_REGEX};
use sandbox::core::script::CheckOptions;
use sandbox::io::config::SandboxConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GradeConfig {
    pub sandbox: SandboxConfig,
    pub batch: BatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchSettings {
    pub parallelism: usize,
    pub window: usize,
    pub use_cache: bool,
    pub include_percentage: bool,
    pub tolerance: f64,
    pub timeout_secs: f64,
    /// `natural_language` or `lean`.
    pub answer_format: String,
    pub extract_from_boxed: bool,
    pub extract_regex: String,
    /// Trust `predicted_answer` on records instead of extracting from `generation`.
    pub use_predicted_answer_key: bool,
    /// Python source defining `math_equal`.
    pub checker_path: Option<PathBuf>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            parallelism: 100,
            window: 1500,
            use_cache: true,
            include_percentage: true,
            tolerance: 1e-4,
            timeout_secs: 10.0,
            answer_format: "natural_language".to_string(),
            extract_from_boxed: true,
            extract_regex: DEFAULT_EXTRACT_REGEX.to_string(),
            use_predicted_answer_key: false,
            checker_path: None,
        }
    }
}

impl BatchSettings {
    pub fn check_options(&self) -> CheckOptions {
        CheckOptions {
            include_percentage: self.include_percentage,
            tolerance: self.tolerance,
            timeout: self.timeout_secs,
        }
    }

    pub fn answer_format(&self) -> Result<AnswerFormat> {
        Ok(self.answer_format.parse()?)
    }

    /// Engine settings; fails on an unknown answer format or a bad regex.
    pub fn to_batch_config(&self) -> Result<BatchConfig> {
        let answer_source = if self.use_predicted_answer_key {
            AnswerSource::PredictedField
        } else {
            AnswerSource::extract(self.extract_from_boxed, &self.extract_regex)?
        };
        let config = BatchConfig {
            parallelism: self.parallelism,
            window: self.window,
            use_cache: self.use_cache,
            options: self.check_options(),
            answer_format: self.answer_format()?,
            answer_source,
        };
        config.validate()?;
        Ok(config)
    }
}

impl GradeConfig {
    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate()?;
        self.batch.to_batch_config().context("invalid [batch] settings")?;
        Ok(())
    }
}

/// Load config from a TOML file, then apply environment overrides.
///
/// If the file is missing, starts from `GradeConfig::default()`.
pub fn load_config(path: &Path) -> Result<GradeConfig> {
    load_config_with(path, |key| std::env::var(key).ok())
}

pub fn load_config_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<GradeConfig> {
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<GradeConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?
    } else {
        GradeConfig::default()
    };
    cfg.sandbox = cfg
        .sandbox
        .with_overrides(lookup)
        .context("apply SANDBOX_* overrides")?;
    cfg.validate()?;
    Ok(cfg)
}

/// Batch flags given on the command line.
#[derive(Debug, Clone, Default)]
pub struct BatchOverrides {
    pub checker_path: Option<PathBuf>,
    pub parallelism: Option<usize>,
    pub window: Option<usize>,
    pub answer_format: Option<String>,
    pub ignore_cache: bool,
    pub use_predicted_answer_key: bool,
}

/// Apply command-line overrides to the file's batch settings.
pub fn apply_batch_overrides(mut base: BatchSettings, overrides: &BatchOverrides) -> Result<BatchSettings> {
    if let Some(checker_path) = &overrides.checker_path {
        base.checker_path = Some(checker_path.clone());
    }
    if let Some(parallelism) = overrides.parallelism {
        base.parallelism = parallelism;
    }
    if let Some(window) = overrides.window {
        base.window = window;
    }
    if let Some(answer_format) = &overrides.answer_format {
        base.answer_format = answer_format.clone();
    }
    if overrides.ignore_cache {
        base.use_cache = false;
    }
    if overrides.use_predicted_answer_key {
        base.use_predicted_answer_key = true;
    }
    base.to_batch_config()?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::io::transport::SandboxKind;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config_with(&temp.path().join("grade.toml"), no_env).expect("load");
        assert_eq!(cfg, GradeConfig::default());
        assert_eq!(cfg.batch.parallelism, 100);
        assert_eq!(cfg.batch.window, 1500);
    }

    #[test]
    fn file_sections_are_merged_over_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("grade.toml");
        fs::write(
            &path,
            r#"
[sandbox]
kind = "piston"
host = "https://piston.example/api/v2"

[batch]
window = 10
answer_format = "lean"
timeout_secs = 30.0
"#,
        )
        .expect("write");

        let cfg = load_config_with(&path, no_env).expect("load");
        assert_eq!(cfg.sandbox.kind, SandboxKind::Piston);
        assert_eq!(cfg.sandbox.port, 6000);
        assert_eq!(cfg.batch.window, 10);
        assert_eq!(cfg.batch.parallelism, 100);
        let batch = cfg.batch.to_batch_config().expect("batch config");
        assert_eq!(batch.answer_format, AnswerFormat::Lean);
        assert_eq!(batch.options.timeout, 30.0);
    }

    #[test]
    fn environment_wins_over_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("grade.toml");
        fs::write(&path, "[sandbox]\nhost = \"from-file\"\n").expect("write");

        let cfg = load_config_with(&path, |key| {
            (key == "SANDBOX_HOST").then(|| "from-env".to_string())
        })
        .expect("load");
        assert_eq!(cfg.sandbox.host, "from-env");
    }

    #[test]
    fn unknown_answer_format_is_rejected_at_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("grade.toml");
        fs::write(&path, "[batch]\nanswer_format = \"multiple_choice\"\n").expect("write");

        let err = load_config_with(&path, no_env).expect_err("bad format");
        assert!(format!("{err:#}").contains("multiple_choice"), "{err:#}");
    }

    #[test]
    fn overrides_apply_on_top_of_settings() {
        let overrides = BatchOverrides {
            parallelism: Some(8),
            ignore_cache: true,
            use_predicted_answer_key: true,
            ..BatchOverrides::default()
        };
        let merged = apply_batch_overrides(BatchSettings::default(), &overrides).expect("merge");
        assert_eq!(merged.parallelism, 8);
        assert!(!merged.use_cache);
        let config = merged.to_batch_config().expect("config");
        assert!(matches!(config.answer_source, AnswerSource::PredictedField));
    }

    #[test]
    fn zero_window_override_is_rejected() {
        let overrides = BatchOverrides {
            window: Some(0),
            ..BatchOverrides::default()
        };
        assert!(apply_batch_overrides(BatchSettings::default(), &overrides).is_err());
    }
}
