//! Side-effecting building blocks: configuration, network transport, SSH
//! tunnels and checkpoint files.

pub mod checkpoint;
pub mod config;
pub mod transport;
pub mod tunnel;
