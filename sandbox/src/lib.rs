//! Client for a remote code-execution sandbox and crash-safe batch grading
//! of model answers.
//!
//! The crate is layered the same way throughout:
//!
//! - **[`core`]**: Pure logic. Sandbox script synthesis, answer extraction,
//!   verification keys and result types. No I/O.
//! - **[`io`]**: Side effects. HTTP transport, SSH tunnels, configuration
//!   and checkpoint files.
//!
//! [`protocol`] executes code with per-session history, [`oracle`] turns
//! executions into correctness verdicts and [`batch`] drives the oracle over
//! whole manifest files.

pub mod batch;
pub mod core;
pub mod error;
pub mod io;
pub mod logging;
pub mod oracle;
pub mod protocol;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{Error, Result};
