//! Pure logic for script synthesis, answer handling and result types.
//!
//! Nothing here touches the network or the filesystem.

pub mod answer;
pub mod script;
pub mod types;
