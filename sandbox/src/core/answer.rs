//! Answer extraction, verification keys and verdict fields for records.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::types::{ProofStatus, Verdict};
use crate::error::Error;

pub const DEFAULT_EXTRACT_REGEX: &str = r"The final answer is (.+)$";

/// Kind of answer held by a manifest, selecting key shape and verdict field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerFormat {
    /// Free-form final answers compared with `expected_answer`; writes `is_correct`.
    NaturalLanguage,
    /// Lean proofs checked by compilation; writes `proof_status`.
    Lean,
}

impl AnswerFormat {
    pub fn verdict_field(self) -> &'static str {
        match self {
            AnswerFormat::NaturalLanguage => "is_correct",
            AnswerFormat::Lean => "proof_status",
        }
    }

    /// Write `verdict` into its field on `record`.
    pub fn write_verdict(self, record: &mut Map<String, Value>, verdict: Verdict) {
        record.insert(self.verdict_field().to_string(), verdict.to_value());
    }

    /// Prior verdict stored on `record`, if any. Null or absent means none;
    /// values this format does not produce are reused verbatim.
    pub fn cached_verdict(self, record: &Map<String, Value>) -> Option<Verdict> {
        let value = record.get(self.verdict_field())?;
        let verdict = match (self, value) {
            (_, Value::Null) => return None,
            (AnswerFormat::NaturalLanguage, Value::Bool(correct)) => Verdict::Answer(*correct),
            (AnswerFormat::Lean, value) => serde_json::from_value::<ProofStatus>(value.clone())
                .map_or_else(|_| Verdict::Prior(value.clone()), Verdict::Proof),
            (_, value) => Verdict::Prior(value.clone()),
        };
        Some(verdict)
    }
}

impl FromStr for AnswerFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "natural_language" => Ok(AnswerFormat::NaturalLanguage),
            "lean" => Ok(AnswerFormat::Lean),
            other => Err(Error::Configuration(format!(
                "unsupported answer format: {other}"
            ))),
        }
    }
}

/// Where the predicted answer of a record comes from.
#[derive(Debug, Clone)]
pub enum AnswerSource {
    /// Re-extract from `generation` on every run.
    Extract {
        /// Prefer the last `\boxed{...}`; otherwise use `regex`.
        from_boxed: bool,
        /// First capture group of the last match is the answer.
        regex: Regex,
    },
    /// Trust the record's existing `predicted_answer`; absence is a data error.
    PredictedField,
}

impl AnswerSource {
    pub fn extract(from_boxed: bool, pattern: &str) -> Result<Self, Error> {
        let regex = Regex::new(&format!("(?m){pattern}"))
            .map_err(|err| Error::Configuration(format!("invalid extract regex: {err}")))?;
        Ok(AnswerSource::Extract { from_boxed, regex })
    }
}

impl Default for AnswerSource {
    fn default() -> Self {
        static DEFAULT_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(&format!("(?m){DEFAULT_EXTRACT_REGEX}")).unwrap());
        AnswerSource::Extract {
            from_boxed: true,
            regex: DEFAULT_RE.clone(),
        }
    }
}

/// Identity used to share one remote check between equal rows of a window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VerificationKey {
    Answer {
        predicted: Option<String>,
        expected: String,
    },
    Proof {
        predicted: String,
    },
}

/// Content of the last `\boxed{...}` (or `\fbox{...}`) with balanced braces.
pub fn last_boxed(text: &str) -> Option<String> {
    let start = text.rfind("\\boxed").or_else(|| text.rfind("\\fbox"))?;
    let rest = &text[start..];
    let open = rest.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in rest[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let inner = &rest[open + 1..open + offset];
                    return Some(inner.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract a final answer from free text.
pub fn extract_answer(generation: &str, from_boxed: bool, regex: &Regex) -> Option<String> {
    if from_boxed {
        return last_boxed(generation);
    }
    regex
        .captures_iter(generation)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Assemble a checkable lean proof from a record's parts.
pub fn lean_proof(header: &str, formal_statement: &str, generation: &str) -> String {
    let body = generation.strip_suffix("```").unwrap_or(generation);
    format!("{header}{formal_statement}{body}")
}

/// Render a JSON scalar as the text compared by the checker.
pub fn answer_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_boxed_handles_nested_braces() {
        let text = r"first \boxed{1} then \boxed{\frac{1}{2}} done";
        assert_eq!(last_boxed(text).as_deref(), Some(r"\frac{1}{2}"));
    }

    #[test]
    fn last_boxed_rejects_unbalanced() {
        assert_eq!(last_boxed(r"\boxed{\frac{1}{2}"), None);
        assert_eq!(last_boxed("no answer"), None);
    }

    #[test]
    fn regex_extraction_uses_last_match_per_line() {
        let source = AnswerSource::extract(false, DEFAULT_EXTRACT_REGEX).expect("regex");
        let AnswerSource::Extract { from_boxed, regex } = source else {
            panic!("expected extract source");
        };
        let text = "The final answer is 4\nwait\nThe final answer is 5";
        assert_eq!(extract_answer(text, from_boxed, &regex).as_deref(), Some("5"));
    }

    #[test]
    fn lean_proof_strips_one_trailing_fence() {
        assert_eq!(
            lean_proof("import Mathlib\n", "theorem t : True := by\n", "  trivial\n```"),
            "import Mathlib\ntheorem t : True := by\n  trivial\n"
        );
    }

    #[test]
    fn cached_verdict_reads_prior_field() {
        let record = json!({"is_correct": true}).as_object().cloned().expect("object");
        assert_eq!(
            AnswerFormat::NaturalLanguage.cached_verdict(&record),
            Some(Verdict::Answer(true))
        );

        let record = json!({"proof_status": "timeout"}).as_object().cloned().expect("object");
        assert_eq!(
            AnswerFormat::Lean.cached_verdict(&record),
            Some(Verdict::Proof(ProofStatus::Timeout))
        );

        let record = json!({"is_correct": null}).as_object().cloned().expect("object");
        assert_eq!(AnswerFormat::NaturalLanguage.cached_verdict(&record), None);
        assert_eq!(AnswerFormat::NaturalLanguage.cached_verdict(&Map::new()), None);
    }

    #[test]
    fn unfamiliar_prior_values_are_reused_verbatim() {
        let record = json!({"is_correct": "yes"}).as_object().cloned().expect("object");
        assert_eq!(
            AnswerFormat::NaturalLanguage.cached_verdict(&record),
            Some(Verdict::Prior(json!("yes")))
        );

        let record = json!({"proof_status": "compiled"}).as_object().cloned().expect("object");
        let verdict = AnswerFormat::Lean.cached_verdict(&record).expect("cached");
        assert_eq!(verdict.to_value(), json!("compiled"));
    }

    #[test]
    fn answer_text_stringifies_numbers() {
        assert_eq!(answer_text(&json!(3)).as_deref(), Some("3"));
        assert_eq!(answer_text(&json!("3")).as_deref(), Some("3"));
        assert_eq!(answer_text(&Value::Null), None);
    }

    #[test]
    fn unknown_answer_format_fails_fast() {
        assert!(matches!(
            "majority".parse::<AnswerFormat>(),
            Err(Error::Configuration(_))
        ));
    }
}
