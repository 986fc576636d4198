//! Synthesis of the python programs shipped to the sandbox.
//!
//! The sandbox runs every request in a fresh interpreter, so a session is
//! emulated by replaying all accepted snippets inside one generated script.
//! Snippets and operands are embedded in triple-quoted literals and must be
//! sanitized first.

use minijinja::{Environment, context};

use crate::error::Result;

const SESSION_TEMPLATE: &str = include_str!("scripts/session.py");
const MATH_CHECK_TEMPLATE: &str = include_str!("scripts/math_check.py");

/// Appended to output cut at `max_output_chars`.
pub const OUTPUT_CUT_MARKER: &str = "<output cut>";

/// Escape `quote` (a python triple quote) and drop trailing line continuations.
pub fn sanitize_triple_quoted(text: &str, quote: &str) -> String {
    let escaped_quote: String = quote.chars().flat_map(|c| ['\\', c]).collect();
    let mut sanitized = text.replace(quote, &escaped_quote);
    while sanitized.ends_with('\\') {
        sanitized.pop();
    }
    sanitized
}

/// Sanitize a snippet for embedding in `"""..."""`.
pub fn sanitize_snippet(code: &str) -> String {
    sanitize_triple_quoted(code, "\"\"\"")
}

/// Sanitize an answer for embedding in `r'''...'''`.
pub fn sanitize_operand(answer: &str) -> String {
    sanitize_triple_quoted(answer, "'''")
}

/// Normalize and bound captured output the same way the session wrapper does.
///
/// Surrounding whitespace is stripped and a single newline appended to
/// non-empty output; anything past `max_chars` characters is replaced by
/// [`OUTPUT_CUT_MARKER`].
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let normalized = format!("{trimmed}\n");
    if normalized.chars().count() <= max_chars {
        return normalized;
    }
    let mut cut: String = normalized.chars().take(max_chars).collect();
    cut.push_str(OUTPUT_CUT_MARKER);
    cut
}

/// Render a float the way python reads it back.
fn python_float(value: f64) -> String {
    format!("{value:?}")
}

fn python_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Arguments forwarded to the remote `math_equal` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckOptions {
    pub include_percentage: bool,
    pub tolerance: f64,
    /// Seconds the checker itself may spend on symbolic simplification.
    pub timeout: f64,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            include_percentage: true,
            tolerance: 1e-4,
            timeout: 10.0,
        }
    }
}

/// Template engine for the generated sandbox programs.
pub struct ScriptEngine {
    env: Environment<'static>,
}

impl ScriptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("session.py", SESSION_TEMPLATE)?;
        env.add_template("math_check.py", MATH_CHECK_TEMPLATE)?;
        Ok(Self { env })
    }

    /// Program replaying `snippets` in a fresh shell and reporting the last one.
    ///
    /// Snippets must already be sanitized.
    pub fn session_program(&self, snippets: &[String], max_output_chars: usize) -> Result<String> {
        let template = self.env.get_template("session.py")?;
        let rendered = template.render(context! {
            snippets => snippets,
            max_output_chars => max_output_chars,
            cut_marker => OUTPUT_CUT_MARKER,
        })?;
        Ok(rendered)
    }

    /// Program comparing two answers with the inlined checker source.
    pub fn math_check_program(
        &self,
        checker_source: &str,
        predicted: &str,
        expected: &str,
        options: CheckOptions,
    ) -> Result<String> {
        let template = self.env.get_template("math_check.py")?;
        let rendered = template.render(context! {
            checker_source => checker_source,
            predicted => sanitize_operand(predicted),
            expected => sanitize_operand(expected),
            include_percentage => python_bool(options.include_percentage),
            tolerance => python_float(options.tolerance),
            timeout => python_float(options.timeout),
        })?;
        Ok(rendered)
    }
}
