//! Platform integration
//!
//! The compute platform is reached only through configured commands: one
//! read-only probe for remote sampling and one command per lifecycle
//! transition.

mod command;

pub use command::{interpret, render, CommandChannel, CommandConfig, CommandLifecycle};
