//! The step orchestration state machine.
//!
//! Every request follows the same shape:
//!
//! 1. load the document and decide what the request means (replay, conflict,
//!    rejection or a new attempt)
//! 2. claim the step with a compare-and-store
//! 3. run the operation through the retry executor with nothing locked
//! 4. commit the outcome with a compare-and-store, re-applying on conflict
//!    for as long as the claim is still ours

use super::idempotency::KeyMatch;
use super::report::{Disposition, ProcessingStatus, StepReport};
use super::retry::{execute_with_retry, RetryError};
use crate::cancellation::CancellationToken;
use crate::citations::{self, VerificationSummary};
use crate::config::EngineConfig;
use crate::core::{
    Document, DocumentId, DocumentStatus, FileRef, InFlightClaim, OutputKind, StepName,
    StepOutput, StepStatus, VerificationMethod, VersionedDocument,
};
use crate::errors::{PipelineError, ProviderError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::observability::{step_span, StepTimer};
use crate::registry::{StepDefinition, StepRegistry};
use crate::store::DocumentStore;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Which operation a step request came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Advance,
    Retry,
}

enum Plan {
    Respond(Disposition),
    Claim { release_to: StepStatus },
}

enum ClaimResult {
    Won(Box<Claimed>),
    Respond(StepReport),
}

/// State held between a successful claim and the final commit.
struct Claimed {
    document: Document,
    version: u64,
    claim: InFlightClaim,
    release_to: StepStatus,
    previous_failed_step: Option<StepName>,
    previous_error: Option<String>,
    source_text: Option<String>,
}

enum Outcome {
    Completed { output: StepOutput, attempts: u32 },
    Failed { cause: String, attempts: u32 },
}

/// Drives documents through the step registry.
///
/// The engine is stateless apart from its collaborators: share it with an
/// `Arc` and call it from any number of tasks. All coordination happens
/// through the store's compare-and-store.
pub struct PipelineEngine {
    registry: Arc<StepRegistry>,
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("steps", &self.registry.steps())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineEngine {
    /// Creates an engine over the standard registry with default settings.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            registry: Arc::new(StepRegistry::standard()),
            store,
            config: EngineConfig::default(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the step registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<StepRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the step registry.
    #[must_use]
    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a document with every step pending.
    ///
    /// # Errors
    ///
    /// Returns a store error if the document cannot be inserted.
    pub async fn create_document(
        &self,
        title: &str,
        file_ref: FileRef,
    ) -> Result<Document, PipelineError> {
        let document = Document::new(title, file_ref, self.registry.steps().iter().copied());
        self.store.insert(&document).await?;

        info!(
            document_id = %document.id,
            ingestion_id = %document.ingestion_id,
            "Created document"
        );
        self.events
            .record(&PipelineEvent::DocumentCreated {
                document_id: document.id,
                ingestion_id: document.ingestion_id.to_string(),
            })
            .await;
        Ok(document)
    }

    /// Loads a document.
    ///
    /// # Errors
    ///
    /// [`PipelineError::DocumentNotFound`], or [`PipelineError::CorruptState`]
    /// if its steps do not match the registry.
    pub async fn document(&self, id: &DocumentId) -> Result<Document, PipelineError> {
        Ok(self.load(id).await?.document)
    }

    /// Reports the processing progress of a document.
    ///
    /// # Errors
    ///
    /// As [`document`](Self::document).
    pub async fn status(&self, id: &DocumentId) -> Result<ProcessingStatus, PipelineError> {
        let document = self.document(id).await?;
        Ok(ProcessingStatus::from_document(
            &document,
            self.config.max_step_failures,
        ))
    }

    /// Deletes a document together with every derived artifact.
    ///
    /// # Errors
    ///
    /// [`PipelineError::DocumentNotFound`] if there is no such document.
    pub async fn delete_document(&self, id: &DocumentId) -> Result<(), PipelineError> {
        self.store.delete(id).await?;
        info!(document_id = %id, "Deleted document");
        self.events
            .record(&PipelineEvent::DocumentDeleted { document_id: *id })
            .await;
        Ok(())
    }

    /// Replaces a document with a fresh identity for the same file.
    ///
    /// The new document has new ids, every step pending and a zero retry
    /// count. The old document and its artifacts are deleted.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConcurrentStepConflict`] while a live attempt holds
    /// the document, or a store error.
    pub async fn reingest(&self, id: &DocumentId) -> Result<Document, PipelineError> {
        let old = self.store.load(id).await?.document;
        if let Some(claim) = old
            .in_flight
            .as_ref()
            .filter(|claim| !claim.is_stale(Utc::now(), self.config.stale_claim_after()))
        {
            return Err(PipelineError::ConcurrentStepConflict {
                step: claim.step,
                in_flight: claim.step,
            });
        }

        let fresh = Document::new(
            old.title.clone(),
            old.file_ref.clone(),
            self.registry.steps().iter().copied(),
        );
        self.store.insert(&fresh).await?;
        self.store.delete(id).await?;

        info!(
            document_id = %fresh.id,
            previous_document_id = %id,
            previous_retry_count = old.retry_count,
            "Re-ingested document"
        );
        self.events
            .record(&PipelineEvent::DocumentReingested {
                document_id: fresh.id,
                previous_document_id: *id,
            })
            .await;
        Ok(fresh)
    }

    /// Marks a skippable step as skipped.
    ///
    /// Skipping a pending or failed step is allowed once its prerequisite is
    /// satisfied. Skipping an already skipped step reports it again.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NotSkippable`], [`PipelineError::PrerequisiteNotMet`],
    /// or [`PipelineError::ConcurrentStepConflict`] while the step is in
    /// progress.
    pub async fn skip_step(
        &self,
        id: &DocumentId,
        step: StepName,
        reason: &str,
    ) -> Result<StepReport, PipelineError> {
        let definition = self.definition(step)?;
        if !definition.skippable {
            return Err(PipelineError::NotSkippable { step });
        }

        let mut last_conflict = None;
        for _ in 0..self.config.max_commit_attempts {
            let VersionedDocument {
                mut document,
                version,
            } = self.load(id).await?;
            self.check_prerequisite(&document, step)?;

            match document.step_status(step)? {
                StepStatus::Skipped => {
                    return Ok(StepReport::from_document(&document, step, Disposition::Skipped, 0));
                }
                StepStatus::Completed => {
                    return Ok(StepReport::from_document(
                        &document,
                        step,
                        Disposition::AlreadyCompleted,
                        0,
                    ));
                }
                StepStatus::InProgress => {
                    return Err(PipelineError::ConcurrentStepConflict {
                        step,
                        in_flight: step,
                    });
                }
                StepStatus::Pending | StepStatus::Failed => {}
            }

            document.step_statuses.transition(step, StepStatus::Skipped)?;
            document.record_mut(step).skip_reason = Some(reason.to_string());
            if document.failed_step == Some(step) {
                document.failed_step = None;
                document.step_error_message = None;
            }
            document.current_step = Some(self.registry.next(step).unwrap_or(step));
            let now = Utc::now();
            if document.status() == DocumentStatus::Completed {
                document.processed_at = Some(now);
            }
            document.updated_at = now;

            match self.store.compare_and_store(&document, version).await {
                Ok(_) => {
                    info!(document_id = %id, step = %step, reason, "Skipped step");
                    self.events
                        .record(&PipelineEvent::StepSkipped {
                            document_id: *id,
                            step,
                            reason: reason.to_string(),
                        })
                        .await;
                    return Ok(StepReport::from_document(&document, step, Disposition::Skipped, 0));
                }
                Err(err @ PipelineError::VersionConflict { .. }) => last_conflict = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(Self::exhausted(last_conflict))
    }

    /// Requests execution of `step` under `idempotency_key`.
    ///
    /// Replays and in-flight duplicates are answered without invoking
    /// `operation`. A failure after the retry policy gave up is recorded and
    /// returned as a report with [`StepReport::failure`] set.
    ///
    /// # Errors
    ///
    /// [`PipelineError::UnknownStep`], [`PipelineError::PrerequisiteNotMet`],
    /// [`PipelineError::ConcurrentStepConflict`], [`PipelineError::StepFailed`],
    /// [`PipelineError::StepSkipped`], [`PipelineError::VersionConflict`], or
    /// a store error.
    pub async fn advance<F, Fut>(
        &self,
        id: &DocumentId,
        step: StepName,
        idempotency_key: &str,
        operation: F,
    ) -> Result<StepReport, PipelineError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<StepOutput, ProviderError>> + Send,
    {
        self.run(id, step, idempotency_key, Entry::Advance, None, operation)
            .await
    }

    /// As [`advance`](Self::advance), stopping between attempts on cancellation.
    ///
    /// A cancelled attempt releases its claim and records no failure.
    ///
    /// # Errors
    ///
    /// As [`advance`](Self::advance), plus [`PipelineError::Cancelled`].
    pub async fn advance_cancellable<F, Fut>(
        &self,
        id: &DocumentId,
        step: StepName,
        idempotency_key: &str,
        token: &CancellationToken,
        operation: F,
    ) -> Result<StepReport, PipelineError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<StepOutput, ProviderError>> + Send,
    {
        self.run(id, step, idempotency_key, Entry::Advance, Some(token), operation)
            .await
    }

    /// Re-runs the failed step of a failed document.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NotFailed`], [`PipelineError::NotTheFailedStep`],
    /// [`PipelineError::RetryLimitExceeded`] once the step has failed
    /// `max_step_failures` times, [`PipelineError::ConcurrentStepConflict`],
    /// or a store error.
    pub async fn retry_failed_step<F, Fut>(
        &self,
        id: &DocumentId,
        step: StepName,
        idempotency_key: &str,
        operation: F,
    ) -> Result<StepReport, PipelineError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<StepOutput, ProviderError>> + Send,
    {
        self.run(id, step, idempotency_key, Entry::Retry, None, operation)
            .await
    }

    /// As [`retry_failed_step`](Self::retry_failed_step), with cancellation.
    ///
    /// # Errors
    ///
    /// As [`retry_failed_step`](Self::retry_failed_step), plus
    /// [`PipelineError::Cancelled`].
    pub async fn retry_failed_step_cancellable<F, Fut>(
        &self,
        id: &DocumentId,
        step: StepName,
        idempotency_key: &str,
        token: &CancellationToken,
        operation: F,
    ) -> Result<StepReport, PipelineError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<StepOutput, ProviderError>> + Send,
    {
        self.run(id, step, idempotency_key, Entry::Retry, Some(token), operation)
            .await
    }

    async fn run<F, Fut>(
        &self,
        id: &DocumentId,
        step: StepName,
        key: &str,
        entry: Entry,
        token: Option<&CancellationToken>,
        operation: F,
    ) -> Result<StepReport, PipelineError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<StepOutput, ProviderError>> + Send,
    {
        let definition = self.definition(step)?;
        let claimed = match self.claim(id, &definition, key, entry).await? {
            ClaimResult::Won(claimed) => claimed,
            ClaimResult::Respond(report) => return Ok(report),
        };

        info!(
            document_id = %id,
            step = %step,
            idempotency_key = key,
            retry = entry == Entry::Retry,
            "Starting step"
        );
        self.events
            .record(&PipelineEvent::StepStarted {
                document_id: *id,
                step,
                idempotency_key: key.to_string(),
                retry: entry == Entry::Retry,
            })
            .await;

        let events = Arc::clone(&self.events);
        let document_id = *id;
        let timer = StepTimer::start(step);
        let result = execute_with_retry(
            &self.config.retry,
            ProviderError::retry_class,
            token,
            |attempt, delay, error: &ProviderError| {
                events.try_record(&PipelineEvent::StepRetryScheduled {
                    document_id,
                    step,
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error: error.to_string(),
                });
            },
            operation,
        )
        .instrument(step_span(id, step))
        .await;
        let duration_ms = timer.finish();

        let outcome = match result {
            Ok(done) => {
                self.accept_output(&claimed, &definition, done.value, done.attempts)
                    .await
            }
            Err(RetryError::Cancelled {
                reason, attempts, ..
            }) => {
                warn!(document_id = %id, step = %step, attempts, reason = %reason, "Step cancelled");
                self.release(*claimed).await?;
                return Err(PipelineError::Cancelled { step, reason });
            }
            Err(err) => Outcome::Failed {
                cause: err
                    .last_error()
                    .map_or_else(|| err.to_string(), ToString::to_string),
                attempts: err.attempts(),
            },
        };

        self.commit(*claimed, outcome, duration_ms).await
    }

    /// Loads the document, decides what the request means and, for a new
    /// attempt, claims the step.
    async fn claim(
        &self,
        id: &DocumentId,
        definition: &StepDefinition,
        key: &str,
        entry: Entry,
    ) -> Result<ClaimResult, PipelineError> {
        let step = definition.name;
        let mut last_conflict = None;

        for _ in 0..self.config.max_commit_attempts {
            let VersionedDocument {
                mut document,
                version,
            } = self.load(id).await?;

            let release_to = match self.plan(&document, step, key, entry)? {
                Plan::Respond(disposition) => {
                    if disposition == Disposition::Replayed {
                        debug!(document_id = %id, step = %step, idempotency_key = key, "Replaying stored result");
                        self.events
                            .record(&PipelineEvent::StepReplayed {
                                document_id: *id,
                                step,
                                idempotency_key: key.to_string(),
                            })
                            .await;
                    }
                    return Ok(ClaimResult::Respond(StepReport::from_document(
                        &document,
                        step,
                        disposition,
                        0,
                    )));
                }
                Plan::Claim { release_to } => release_to,
            };

            let source_text = if definition.output_kind == OutputKind::Citations {
                Some(Self::source_text(&document)?)
            } else {
                None
            };
            let previous_failed_step = document.failed_step;
            let previous_error = document.step_error_message.clone();
            let claim = InFlightClaim {
                step,
                idempotency_key: key.to_string(),
                attempt_id: Uuid::new_v4(),
                started_at: Utc::now(),
            };

            document.step_statuses.transition(step, StepStatus::InProgress)?;
            document.in_flight = Some(claim.clone());
            document.current_step = Some(step);
            document.idempotency_key = Some(key.to_string());
            document.failed_step = None;
            document.step_error_message = None;
            document.touch();

            match self.store.compare_and_store(&document, version).await {
                Ok(version) => {
                    return Ok(ClaimResult::Won(Box::new(Claimed {
                        document,
                        version,
                        claim,
                        release_to,
                        previous_failed_step,
                        previous_error,
                        source_text,
                    })));
                }
                Err(err @ PipelineError::VersionConflict { .. }) => {
                    debug!(document_id = %id, step = %step, "Lost claim race, reloading");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(Self::exhausted(last_conflict))
    }

    fn plan(
        &self,
        document: &Document,
        step: StepName,
        key: &str,
        entry: Entry,
    ) -> Result<Plan, PipelineError> {
        if entry == Entry::Advance {
            self.check_prerequisite(document, step)?;
        }

        let status = document.step_status(step)?;
        if status == StepStatus::InProgress {
            return match document.in_flight.as_ref() {
                Some(claim) if !claim.is_stale(Utc::now(), self.config.stale_claim_after()) => {
                    if claim.idempotency_key == key {
                        Ok(Plan::Respond(Disposition::InFlight))
                    } else {
                        Err(PipelineError::ConcurrentStepConflict {
                            step,
                            in_flight: step,
                        })
                    }
                }
                abandoned => {
                    warn!(
                        document_id = %document.id,
                        step = %step,
                        started_at = ?abandoned.map(|claim| claim.started_at),
                        "Taking over abandoned claim"
                    );
                    Ok(Plan::Claim {
                        release_to: StepStatus::Pending,
                    })
                }
            };
        }

        let recorded_key = document
            .record(step)
            .and_then(|record| record.idempotency_key.as_deref());
        let key_match = KeyMatch::compare(recorded_key, key);

        let plan = match entry {
            Entry::Advance => match status {
                StepStatus::Completed if key_match == KeyMatch::Same => {
                    Ok(Plan::Respond(Disposition::Replayed))
                }
                StepStatus::Completed => Ok(Plan::Respond(Disposition::AlreadyCompleted)),
                StepStatus::Skipped => Err(PipelineError::StepSkipped { step }),
                StepStatus::Failed => Err(PipelineError::StepFailed {
                    step,
                    cause: Self::failure_cause(document, step),
                }),
                StepStatus::Pending | StepStatus::InProgress => Ok(Plan::Claim {
                    release_to: StepStatus::Pending,
                }),
            },
            Entry::Retry => {
                if status == StepStatus::Completed && key_match == KeyMatch::Same {
                    return Ok(Plan::Respond(Disposition::Replayed));
                }
                if document.status() != DocumentStatus::Failed {
                    return Err(PipelineError::NotFailed {
                        document_id: document.id.to_string(),
                    });
                }
                let failed = document.failed_step.ok_or_else(|| {
                    PipelineError::CorruptState(format!(
                        "document {} is failed but records no failed step",
                        document.id
                    ))
                })?;
                if failed != step {
                    return Err(PipelineError::NotTheFailedStep {
                        requested: step,
                        failed,
                    });
                }
                let failures = document.record(step).map_or(0, |record| record.failure_count);
                if failures >= self.config.max_step_failures {
                    return Err(PipelineError::RetryLimitExceeded {
                        step,
                        failures,
                        limit: self.config.max_step_failures,
                    });
                }
                Ok(Plan::Claim {
                    release_to: StepStatus::Failed,
                })
            }
        }?;

        if let Plan::Claim { .. } = plan {
            if let Some(claim) = document.in_flight.as_ref().filter(|claim| claim.step != step) {
                return Err(PipelineError::ConcurrentStepConflict {
                    step,
                    in_flight: claim.step,
                });
            }
        }
        Ok(plan)
    }

    async fn accept_output(
        &self,
        claimed: &Claimed,
        definition: &StepDefinition,
        output: StepOutput,
        attempts: u32,
    ) -> Outcome {
        if output.kind() != definition.output_kind {
            return Outcome::Failed {
                cause: format!(
                    "Step '{}' produced {} output, expected {}",
                    definition.name,
                    output.kind(),
                    definition.output_kind
                ),
                attempts,
            };
        }

        let output = match (output, claimed.source_text.as_deref()) {
            (StepOutput::Citations(batch), Some(source)) => {
                let verified = citations::verify(batch, source);
                let document_id = claimed.document.id;
                for citation in verified.iter().filter(|c| !c.verified) {
                    let ratio = match citation.verification {
                        VerificationMethod::Unverified { ratio } => ratio,
                        _ => 0.0,
                    };
                    warn!(
                        document_id = %document_id,
                        order = citation.order,
                        ratio,
                        snippet = %citation.snippet,
                        "Citation not found in source text"
                    );
                    self.events
                        .record(&PipelineEvent::CitationUnverified {
                            document_id,
                            order: citation.order,
                            snippet: citation.snippet.clone(),
                            ratio,
                        })
                        .await;
                }
                let summary = VerificationSummary::of(&verified);
                info!(
                    document_id = %document_id,
                    total = summary.total,
                    exact = summary.exact,
                    partial = summary.partial,
                    unverified = summary.unverified,
                    "Verified citations"
                );
                StepOutput::Citations(verified)
            }
            (output, _) => output,
        };

        Outcome::Completed { output, attempts }
    }

    async fn commit(
        &self,
        claimed: Claimed,
        outcome: Outcome,
        duration_ms: u64,
    ) -> Result<StepReport, PipelineError> {
        let Claimed {
            mut document,
            mut version,
            claim,
            ..
        } = claimed;
        let step = claim.step;
        let mut last_conflict = None;

        for round in 0..self.config.max_commit_attempts {
            if round > 0 {
                let fresh = self.load(&document.id).await?;
                document = fresh.document;
                version = fresh.version;
            }
            self.apply_outcome(&mut document, &claim, &outcome)?;

            match self.store.compare_and_store(&document, version).await {
                Ok(_) => {
                    self.announce(&document, step, &outcome, duration_ms).await;
                    let attempts = match outcome {
                        Outcome::Completed { attempts, .. } | Outcome::Failed { attempts, .. } => {
                            attempts
                        }
                    };
                    return Ok(StepReport::from_document(
                        &document,
                        step,
                        Disposition::Executed,
                        attempts,
                    ));
                }
                Err(err @ PipelineError::VersionConflict { .. }) => {
                    debug!(document_id = %document.id, step = %step, round, "Commit conflict, re-applying");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(Self::exhausted(last_conflict))
    }

    fn apply_outcome(
        &self,
        document: &mut Document,
        claim: &InFlightClaim,
        outcome: &Outcome,
    ) -> Result<(), PipelineError> {
        Self::ensure_claim_held(document, claim)?;
        let step = claim.step;
        let now = Utc::now();

        match outcome {
            Outcome::Completed { output, attempts } => {
                document.step_statuses.transition(step, StepStatus::Completed)?;
                let record = document.record_mut(step);
                record.idempotency_key = Some(claim.idempotency_key.clone());
                record.output = Some(output.clone());
                record.completed_at = Some(now);
                record.attempts = *attempts;
                record.last_error = None;

                document.failed_step = None;
                document.step_error_message = None;
                document.current_step = Some(self.registry.next(step).unwrap_or(step));
                if document.status() == DocumentStatus::Completed {
                    document.processed_at = Some(now);
                }
            }
            Outcome::Failed { cause, attempts } => {
                document.step_statuses.transition(step, StepStatus::Failed)?;
                let record = document.record_mut(step);
                record.failure_count = record.failure_count.saturating_add(1);
                record.last_error = Some(cause.clone());
                record.attempts = *attempts;

                document.failed_step = Some(step);
                document.step_error_message = Some(cause.clone());
                document.retry_count = document.retry_count.saturating_add(1);
                document.current_step = Some(step);
            }
        }

        document.in_flight = None;
        document.idempotency_key = Some(claim.idempotency_key.clone());
        document.updated_at = now;
        Ok(())
    }

    async fn announce(&self, document: &Document, step: StepName, outcome: &Outcome, duration_ms: u64) {
        match outcome {
            Outcome::Completed { output, attempts } => {
                let next_step = self.registry.next(step);
                info!(
                    document_id = %document.id,
                    step = %step,
                    attempts,
                    duration_ms,
                    next_step = ?next_step,
                    summary = %output.summary(),
                    "Step completed"
                );
                self.events
                    .record(&PipelineEvent::StepCompleted {
                        document_id: document.id,
                        step,
                        attempts: *attempts,
                        duration_ms,
                        next_step,
                    })
                    .await;
            }
            Outcome::Failed { cause, attempts } => {
                warn!(
                    document_id = %document.id,
                    step = %step,
                    attempts,
                    retry_count = document.retry_count,
                    cause = %cause,
                    "Step failed"
                );
                self.events
                    .record(&PipelineEvent::StepFailed {
                        document_id: document.id,
                        step,
                        cause: cause.clone(),
                        attempts: *attempts,
                        retry_count: document.retry_count,
                    })
                    .await;
            }
        }
    }

    /// Puts a cancelled step back to where it was before the claim.
    async fn release(&self, claimed: Claimed) -> Result<(), PipelineError> {
        let Claimed {
            mut document,
            mut version,
            claim,
            release_to,
            previous_failed_step,
            previous_error,
            ..
        } = claimed;
        let mut last_conflict = None;

        for round in 0..self.config.max_commit_attempts {
            if round > 0 {
                let fresh = self.load(&document.id).await?;
                document = fresh.document;
                version = fresh.version;
            }
            if Self::ensure_claim_held(&document, &claim).is_err() {
                return Ok(());
            }

            document.step_statuses.transition(claim.step, release_to)?;
            if release_to == StepStatus::Failed {
                document.failed_step = previous_failed_step;
                document.step_error_message.clone_from(&previous_error);
            }
            document.in_flight = None;
            document.touch();

            match self.store.compare_and_store(&document, version).await {
                Ok(_) => return Ok(()),
                Err(err @ PipelineError::VersionConflict { .. }) => last_conflict = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(Self::exhausted(last_conflict))
    }

    async fn load(&self, id: &DocumentId) -> Result<VersionedDocument, PipelineError> {
        let loaded = self.store.load(id).await?;
        loaded
            .document
            .step_statuses
            .validate_order(self.registry.steps())?;
        Ok(loaded)
    }

    fn definition(&self, step: StepName) -> Result<StepDefinition, PipelineError> {
        self.registry
            .definition(step)
            .copied()
            .ok_or(PipelineError::UnknownStep(step))
    }

    fn check_prerequisite(&self, document: &Document, step: StepName) -> Result<(), PipelineError> {
        if let Some(prerequisite) = self.registry.prerequisite(step) {
            let status = document.step_status(prerequisite)?;
            if !status.satisfies_prerequisite() {
                return Err(PipelineError::PrerequisiteNotMet {
                    step,
                    prerequisite,
                    status,
                });
            }
        }
        Ok(())
    }

    fn ensure_claim_held(document: &Document, claim: &InFlightClaim) -> Result<(), PipelineError> {
        match document.in_flight.as_ref() {
            Some(current) if current.attempt_id == claim.attempt_id => Ok(()),
            current => Err(PipelineError::ConcurrentStepConflict {
                step: claim.step,
                in_flight: current.map_or(claim.step, |c| c.step),
            }),
        }
    }

    fn source_text(document: &Document) -> Result<String, PipelineError> {
        document
            .output_of_kind(OutputKind::Text)
            .and_then(StepOutput::as_text)
            .map(|text| text.text.clone())
            .ok_or_else(|| {
                PipelineError::CorruptState(format!(
                    "document {} has no extracted text to verify citations against",
                    document.id
                ))
            })
    }

    fn failure_cause(document: &Document, step: StepName) -> String {
        document
            .record(step)
            .and_then(|record| record.last_error.clone())
            .or_else(|| document.step_error_message.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }

    fn exhausted(last_conflict: Option<PipelineError>) -> PipelineError {
        last_conflict.unwrap_or_else(|| {
            PipelineError::Config("max_commit_attempts must be at least 1".to_string())
        })
    }
}
