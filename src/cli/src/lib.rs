//! Keel CLI - run the coding agent and manage its checkpoints, sessions and permissions.

pub mod commands;
pub mod output;
pub mod prompt;
