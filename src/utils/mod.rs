//! Process-level helpers shared by the binary and the connectors.

pub mod bootstrap;
pub mod retry;
