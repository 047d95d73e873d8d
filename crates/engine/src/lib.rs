//! Upload sessions and task orchestration for Quire.
//!
//! This crate provides:
//! - The chunked upload lifecycle (`UploadSessionManager`)
//! - Per-task ordered progress logs with live subscription (`ProgressBus`)
//! - Generate and refine tasks with retry and cancellation (`TaskOrchestrator`)
//! - The generation operation seam (`Generator`)

pub mod error;
pub mod generator;
pub mod inputs;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod uploads;

pub use error::{TaskError, TaskResult, UploadError, UploadResult};
pub use generator::{
    DryRunGenerator, GenerationError, GenerationRequest, Generator, HttpGenerator,
};
pub use inputs::{Document, InputResolver};
pub use orchestrator::TaskOrchestrator;
pub use progress::{ProgressBus, ProgressError};
pub use retry::RetryPolicy;
pub use uploads::{Completion, UploadSessionManager};
