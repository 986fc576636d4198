//! Windowed, de-duplicating batch verification over manifest files.
//!
//! Manifests are read in lockstep, one row tuple at a time. Each window of
//! tuples shares a key to task map so equal checks run once. When the window
//! fills, verdicts are awaited in row order, written into the records and
//! appended to each manifest's checkpoint. Manifests are replaced only after
//! every row has been processed.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

use crate::core::answer::{
    AnswerFormat, AnswerSource, VerificationKey, answer_text, extract_answer, lean_proof,
};
use crate::core::script::CheckOptions;
use crate::core::types::Verdict;
use crate::error::{Error, Result};
use crate::io::checkpoint::Checkpoint;
use crate::oracle::Verifier;

const MAX_PARALLELISM: usize = 10_000;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Concurrent remote checks.
    pub parallelism: usize,
    /// Row tuples held in memory between checkpoint flushes.
    pub window: usize,
    /// Reuse verdicts already present on records.
    pub use_cache: bool,
    pub options: CheckOptions,
    pub answer_format: AnswerFormat,
    pub answer_source: AnswerSource,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallelism: 100,
            window: 1500,
            use_cache: true,
            options: CheckOptions::default(),
            answer_format: AnswerFormat::NaturalLanguage,
            answer_source: AnswerSource::default(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(Error::Configuration(format!(
                "parallelism must be between 1 and {MAX_PARALLELISM}, got {}",
                self.parallelism
            )));
        }
        if self.window == 0 {
            return Err(Error::Configuration("window must be at least 1".to_string()));
        }
        if !(self.options.timeout.is_finite() && self.options.timeout > 0.0) {
            return Err(Error::Configuration(format!(
                "timeout must be positive, got {}",
                self.options.timeout
            )));
        }
        Ok(())
    }
}

/// Counters reported after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub files: usize,
    /// Lines read across all files, passthrough lines included.
    pub rows: usize,
    /// Remote checks submitted to the pool.
    pub dispatched: usize,
    /// Rows whose prior verdict was reused.
    pub cached: usize,
    /// Rows that shared an earlier row's check in the same window.
    pub deduplicated: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    fn start(files: usize) -> Self {
        let now = Utc::now();
        Self {
            files,
            rows: 0,
            dispatched: 0,
            cached: 0,
            deduplicated: 0,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

type SharedVerdict = Shared<BoxFuture<'static, std::result::Result<Verdict, Arc<Error>>>>;

#[derive(Clone)]
enum Task {
    Resolved(Verdict),
    Pending(SharedVerdict),
}

enum Slot {
    /// File already exhausted at this row.
    Absent,
    /// Blank, null or empty-object line written back unchanged.
    Passthrough(String),
    Record {
        line: usize,
        record: Map<String, Value>,
        task: Task,
    },
}

pub struct BatchVerifier<V> {
    verifier: Arc<V>,
    config: BatchConfig,
}

impl<V: Verifier> BatchVerifier<V> {
    pub fn new(verifier: Arc<V>, config: BatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { verifier, config })
    }

    pub fn verifier(&self) -> &Arc<V> {
        &self.verifier
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Verify every record and write the verdict into the format's field.
    pub async fn run(&self, manifests: &[PathBuf]) -> Result<BatchSummary> {
        let format = self.config.answer_format;
        self.run_with(manifests, move |record, verdict| {
            format.write_verdict(record, verdict);
        })
        .await
    }

    /// Verify every record, applying `update` to each record with its verdict.
    #[instrument(skip_all, fields(files = manifests.len(), window = self.config.window))]
    pub async fn run_with<F>(&self, manifests: &[PathBuf], update: F) -> Result<BatchSummary>
    where
        F: Fn(&mut Map<String, Value>, Verdict),
    {
        let mut summary = BatchSummary::start(manifests.len());
        let checkpoints: Vec<Checkpoint> = manifests.iter().map(Checkpoint::for_manifest).collect();
        for checkpoint in &checkpoints {
            checkpoint.discard()?;
        }
        let mut readers = manifests
            .iter()
            .map(|path| open_lines(path))
            .collect::<Result<Vec<_>>>()?;

        let permits = Arc::new(Semaphore::new(self.config.parallelism));
        let mut window: Vec<Vec<Slot>> = Vec::with_capacity(self.config.window);
        let mut tasks: HashMap<VerificationKey, Task> = HashMap::new();
        let mut line = 0;

        loop {
            line += 1;
            let mut tuple = Vec::with_capacity(manifests.len());
            let mut any = false;
            for (path, lines) in manifests.iter().zip(readers.iter_mut()) {
                let raw = lines
                    .next()
                    .transpose()
                    .map_err(|err| Error::io("read manifest", path, err))?;
                any |= raw.is_some();
                let slot = self.prepare(path, line, raw, &mut tasks, &permits, &mut summary)?;
                tuple.push(slot);
            }
            if !any {
                break;
            }
            window.push(tuple);
            if window.len() >= self.config.window {
                self.flush(&mut window, &mut tasks, &checkpoints, manifests, &update)
                    .await?;
            }
        }
        if !window.is_empty() {
            self.flush(&mut window, &mut tasks, &checkpoints, manifests, &update)
                .await?;
        }

        for checkpoint in &checkpoints {
            checkpoint.commit()?;
        }
        summary.finished_at = Utc::now();
        info!(
            rows = summary.rows,
            dispatched = summary.dispatched,
            cached = summary.cached,
            deduplicated = summary.deduplicated,
            "batch finished"
        );
        Ok(summary)
    }

    fn prepare(
        &self,
        path: &Path,
        line: usize,
        raw: Option<String>,
        tasks: &mut HashMap<VerificationKey, Task>,
        permits: &Arc<Semaphore>,
        summary: &mut BatchSummary,
    ) -> Result<Slot> {
        let Some(raw) = raw else {
            return Ok(Slot::Absent);
        };
        summary.rows += 1;
        if raw.trim().is_empty() {
            return Ok(Slot::Passthrough(raw));
        }
        let mut record = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Null) => return Ok(Slot::Passthrough(raw)),
            Ok(Value::Object(record)) if record.is_empty() => return Ok(Slot::Passthrough(raw)),
            Ok(Value::Object(record)) => record,
            Ok(other) => {
                return Err(Error::data(
                    path,
                    line,
                    format!("expected a JSON object, found {other}"),
                ));
            }
            Err(err) => return Err(Error::data(path, line, format!("malformed JSON: {err}"))),
        };

        let key = self
            .verification_key(&mut record)
            .map_err(|message| Error::data(path, line, message))?;

        let task = if let Some(task) = tasks.get(&key) {
            summary.deduplicated += 1;
            task.clone()
        } else {
            let cached = if self.config.use_cache {
                self.config.answer_format.cached_verdict(&record)
            } else {
                None
            };
            let task = match (cached, &key) {
                (Some(verdict), _) => {
                    summary.cached += 1;
                    Task::Resolved(verdict)
                }
                (None, VerificationKey::Answer { predicted: None, .. }) => {
                    Task::Resolved(Verdict::Answer(false))
                }
                (None, _) => {
                    summary.dispatched += 1;
                    Task::Pending(self.dispatch(key.clone(), permits))
                }
            };
            tasks.insert(key, task.clone());
            task
        };
        Ok(Slot::Record { line, record, task })
    }

    /// Resolve the predicted answer and build the dedup key, recording the
    /// extracted answer or assembled proof on the record.
    fn verification_key(
        &self,
        record: &mut Map<String, Value>,
    ) -> std::result::Result<VerificationKey, String> {
        match self.config.answer_format {
            AnswerFormat::NaturalLanguage => {
                let expected = record
                    .get("expected_answer")
                    .and_then(answer_text)
                    .ok_or("missing expected_answer")?;
                let predicted = match &self.config.answer_source {
                    AnswerSource::Extract { from_boxed, regex } => {
                        let generation = string_field(record, "generation")?;
                        let predicted = extract_answer(generation, *from_boxed, regex);
                        record.insert(
                            "predicted_answer".to_string(),
                            predicted.clone().map_or(Value::Null, Value::String),
                        );
                        predicted
                    }
                    AnswerSource::PredictedField => answer_text(
                        record
                            .get("predicted_answer")
                            .ok_or("missing predicted_answer")?,
                    ),
                };
                Ok(VerificationKey::Answer {
                    predicted,
                    expected,
                })
            }
            AnswerFormat::Lean => {
                let predicted = match &self.config.answer_source {
                    AnswerSource::Extract { .. } => {
                        let predicted = lean_proof(
                            string_field(record, "header")?,
                            string_field(record, "formal_statement")?,
                            string_field(record, "generation")?,
                        );
                        record.insert(
                            "predicted_answer".to_string(),
                            Value::String(predicted.clone()),
                        );
                        predicted
                    }
                    AnswerSource::PredictedField => {
                        string_field(record, "predicted_answer")?.to_string()
                    }
                };
                Ok(VerificationKey::Proof { predicted })
            }
        }
    }

    fn dispatch(&self, key: VerificationKey, permits: &Arc<Semaphore>) -> SharedVerdict {
        let verifier = Arc::clone(&self.verifier);
        let permits = Arc::clone(permits);
        let options = self.config.options;
        let handle = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|err| Error::Worker(err.to_string()))?;
            match key {
                VerificationKey::Answer {
                    predicted: Some(predicted),
                    expected,
                } => verifier
                    .check_answer(&predicted, &expected, options)
                    .await
                    .map(|check| Verdict::Answer(check.correct)),
                VerificationKey::Answer { predicted: None, .. } => Ok(Verdict::Answer(false)),
                VerificationKey::Proof { predicted } => verifier
                    .check_proof(&predicted, options.timeout)
                    .await
                    .map(Verdict::Proof),
            }
        });
        async move {
            match handle.await {
                Ok(result) => result.map_err(Arc::new),
                Err(err) => Err(Arc::new(Error::Worker(err.to_string()))),
            }
        }
        .boxed()
        .shared()
    }

    async fn flush<F>(
        &self,
        window: &mut Vec<Vec<Slot>>,
        tasks: &mut HashMap<VerificationKey, Task>,
        checkpoints: &[Checkpoint],
        manifests: &[PathBuf],
        update: &F,
    ) -> Result<()>
    where
        F: Fn(&mut Map<String, Value>, Verdict),
    {
        let tuples = window.len();
        let mut lines: Vec<Vec<String>> = vec![Vec::new(); checkpoints.len()];
        for tuple in window.drain(..) {
            for (file, slot) in tuple.into_iter().enumerate() {
                match slot {
                    Slot::Absent => {}
                    Slot::Passthrough(raw) => lines[file].push(raw),
                    Slot::Record {
                        line,
                        mut record,
                        task,
                    } => {
                        let verdict = match task {
                            Task::Resolved(verdict) => verdict,
                            Task::Pending(pending) => pending.await.map_err(Error::Shared)?,
                        };
                        update(&mut record, verdict);
                        let serialized = serde_json::to_string(&record).map_err(|err| {
                            Error::data(&manifests[file], line, format!("serialize record: {err}"))
                        })?;
                        lines[file].push(serialized);
                    }
                }
            }
        }
        for (checkpoint, lines) in checkpoints.iter().zip(&lines) {
            checkpoint.append_lines(lines)?;
        }
        debug!(keys = tasks.len(), "clearing window");
        tasks.clear();
        info!(rows = tuples, "window flushed");
        Ok(())
    }
}

fn open_lines(path: &Path) -> Result<Lines<BufReader<File>>> {
    let file = File::open(path).map_err(|err| Error::io("open manifest", path, err))?;
    Ok(BufReader::new(file).lines())
}

fn string_field<'a>(record: &'a Map<String, Value>, field: &str) -> std::result::Result<&'a str, String> {
    match record.get(field) {
        Some(Value::String(value)) => Ok(value),
        Some(other) => Err(format!("field {field} must be a string, found {other}")),
        None => Err(format!("missing {field}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_rejects_zero_sizes() {
        let config = BatchConfig {
            window: 0,
            ..BatchConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = BatchConfig {
            parallelism: 0,
            ..BatchConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
        assert!(BatchConfig::default().validate().is_ok());
    }

    #[test]
    fn string_field_reports_missing_and_mistyped() {
        let record = json!({"header": 3}).as_object().cloned().expect("object");
        assert_eq!(
            string_field(&record, "generation"),
            Err("missing generation".to_string())
        );
        assert_eq!(
            string_field(&record, "header"),
            Err("field header must be a string, found 3".to_string())
        );
    }
}
