//! idlewatch daemon: configuration, HTTP surface and run modes

pub mod api;
pub mod config;
pub mod runtime;
