//! Tracing setup and step timing.

use crate::config::LogConfig;
use crate::core::{DocumentId, StepName};
use crate::errors::PipelineError;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured filter when set.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if the filter does not parse or a
/// global subscriber is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), PipelineError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| PipelineError::Config(format!("invalid log filter: {e}")))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| PipelineError::Config(format!("tracing already initialized: {e}")))
}

/// Creates the span every step attempt runs in.
#[must_use]
pub fn step_span(document_id: &DocumentId, step: StepName) -> tracing::Span {
    tracing::info_span!("step", document_id = %document_id, step = %step)
}

/// Measures how long a step operation took.
#[derive(Debug)]
pub struct StepTimer {
    start: Instant,
    step: StepName,
}

impl StepTimer {
    /// Starts timing a step.
    #[must_use]
    pub fn start(step: StepName) -> Self {
        Self {
            start: Instant::now(),
            step,
        }
    }

    /// Returns the timed step.
    #[must_use]
    pub fn step(&self) -> StepName {
        self.step
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Finishes timing, logs the duration and returns it in milliseconds.
    pub fn finish(self) -> u64 {
        let duration_ms = self.elapsed_ms();
        tracing::debug!(step = %self.step, duration_ms, "Step operation finished");
        duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_timer() {
        let timer = StepTimer::start(StepName::ExtractText);
        std::thread::sleep(std::time::Duration::from_millis(10));

        assert_eq!(timer.step(), StepName::ExtractText);
        assert!(timer.finish() >= 10);
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let err = init_tracing(&LogConfig::default().with_filter("lessonflow=notalevel"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
