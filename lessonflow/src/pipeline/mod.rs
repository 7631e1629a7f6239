//! Step orchestration.
//!
//! This module provides:
//! - The pipeline engine and its step state machine
//! - Retry policies and the retry executor
//! - Idempotency key helpers
//! - Reports returned to callers

mod engine;
mod idempotency;
mod report;
mod retry;


pub use engine::PipelineEngine;
pub use idempotency::{derive_idempotency_key, step_idempotency_key, KeyMatch};
pub use report::{next_expected_step, Disposition, ProcessingStatus, StepFailure, StepReport};
pub use retry::{
    execute_with_retry, with_retry, with_retry_cancellable, BackoffStrategy, JitterStrategy,
    RetryError, RetryOutcome, RetryPolicy, RetryState,
};
