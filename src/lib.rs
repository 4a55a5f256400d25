//! brewq - fans brewery records out to durable queues and consumes them
//! with acknowledged, prefetch-limited dispatchers.
pub mod app;
pub mod broker;
pub mod cli;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod distributor;
pub mod error;
pub mod handlers;
pub mod notification;
pub mod outputs;
pub mod rules;
pub mod source;
pub mod task_manager;
pub mod topology;

// Re-export core types for convenience
pub use crate::core::*;
pub use error::PipelineError;
