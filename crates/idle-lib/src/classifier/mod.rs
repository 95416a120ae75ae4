//! Multi-stage idle classification
//!
//! Three ordered, short-circuiting stages:
//! - interactive sessions: any live session means `active`
//! - background work: any non-session metric at or above its threshold
//!   means `working`
//! - sustained quiet: continuous quiet time measured from `idle_since`
//!   decides between `idle-candidate` and `idle-confirmed`

mod pipeline;

pub use pipeline::{
    background_work, classify, interactive_sessions, sustained_quiet, BusyMetric,
    ClassificationOutcome,
};
