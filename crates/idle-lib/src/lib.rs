//! Idle detection and lifecycle control for long-lived compute instances
//!
//! This crate provides the core functionality for:
//! - Metric sampling, locally from /proc or remotely through a command channel
//! - Multi-stage idle classification against layered threshold profiles
//! - Claim-before-act coordination through a shared state store
//! - Lifecycle actions with hibernate-to-stop fallback
//! - Fleet-wide and on-instance scheduling, audit, health and observability

pub mod admin;
pub mod agent;
pub mod audit;
pub mod classifier;
pub mod collector;
pub mod detector;
pub mod error;
pub mod executor;
pub mod health;
pub mod models;
pub mod observability;
pub mod platform;
pub mod policy;
pub mod state;

pub use error::{IdleError, IdleResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{IdleMetrics, StructuredLogger};
