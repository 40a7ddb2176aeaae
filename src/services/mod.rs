//! Background services: reconciliation and metrics

pub mod metrics;
pub mod reconciler;

pub use metrics::Metrics;
pub use reconciler::{Reconciler, ReconcilerStats};
