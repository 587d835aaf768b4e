use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome};
use crate::domain::approval::{Actor, ApprovalEvent, ApprovalRecord, EventPayload, SubjectId};
use crate::errors::{BatchError, WorkflowError};
use crate::store::ApprovalRecordStore;
use crate::workflow::engine::WorkflowEngine;

/// Cooperative cancellation, checked between subjects only.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchRequest {
    pub subject_ids: Vec<SubjectId>,
    pub event: ApprovalEvent,
    pub actor: Actor,
    pub payload: EventPayload,
}

impl BatchRequest {
    pub fn new(subject_ids: Vec<SubjectId>, event: ApprovalEvent, actor: Actor) -> Self {
        Self { subject_ids, event, actor, payload: EventPayload::default() }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Distinct subject ids in ascending order.
    pub fn ordered_subjects(&self) -> Vec<SubjectId> {
        self.subject_ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub event: ApprovalEvent,
    /// Updated records, ascending by subject id.
    pub records: Vec<ApprovalRecord>,
}

impl BatchResult {
    pub fn subject_ids(&self) -> Vec<SubjectId> {
        self.records.iter().map(|record| record.subject_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Applies one event to many subjects: validate every subject first, then
/// apply in ascending subject order. No lock is held across subjects.
pub struct BatchCoordinator<S> {
    engine: Arc<WorkflowEngine<S>>,
}

impl<S> BatchCoordinator<S>
where
    S: ApprovalRecordStore,
{
    pub fn new(engine: Arc<WorkflowEngine<S>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine<S>> {
        &self.engine
    }

    pub async fn apply_batch(&self, request: &BatchRequest) -> Result<BatchResult, BatchError> {
        self.apply_batch_with_cancellation(request, &CancellationFlag::new()).await
    }

    pub async fn apply_batch_with_cancellation(
        &self,
        request: &BatchRequest,
        cancellation: &CancellationFlag,
    ) -> Result<BatchResult, BatchError> {
        let correlation_id = Uuid::new_v4().to_string();
        let subjects = request.ordered_subjects();
        let span = tracing::info_span!(
            "approval.batch",
            event = request.event.as_str(),
            actor_id = %request.actor.id,
            subjects = subjects.len(),
            correlation_id = %correlation_id,
        );

        let result = self.run(request, &subjects, cancellation).instrument(span).await;

        let context = AuditContext::new(None, correlation_id, request.actor.id.as_str());
        self.report(&context, request.event, &subjects, &result);
        result
    }

    async fn run(
        &self,
        request: &BatchRequest,
        subjects: &[SubjectId],
        cancellation: &CancellationFlag,
    ) -> Result<BatchResult, BatchError> {
        if subjects.is_empty() {
            return Ok(BatchResult { event: request.event, records: Vec::new() });
        }

        for subject_id in subjects {
            if let Err(error) = self
                .engine
                .preflight(subject_id, request.event, &request.actor, &request.payload)
                .await
            {
                return Err(validation_failure(subject_id, error));
            }
        }

        let mut records: Vec<ApprovalRecord> = Vec::with_capacity(subjects.len());
        for (index, subject_id) in subjects.iter().enumerate() {
            if cancellation.is_cancelled() {
                warn!(
                    event_name = "approval.batch_cancelled",
                    committed = index,
                    skipped = subjects.len() - index,
                    "batch cancelled between subjects"
                );
                return Err(BatchError::Cancelled {
                    committed: subjects[..index].to_vec(),
                    skipped: subjects[index..].to_vec(),
                });
            }

            match self
                .engine
                .apply(subject_id, request.event, &request.actor, &request.payload)
                .await
            {
                Ok(record) => records.push(record),
                Err(cause) => {
                    warn!(
                        event_name = "approval.batch_partial",
                        failing_subject_id = %subject_id,
                        committed = index,
                        error = %cause,
                        "batch stopped after a failed apply; committed subjects are kept"
                    );
                    return Err(BatchError::PartialApplyFailure {
                        committed: subjects[..index].to_vec(),
                        failed: subjects[index..].to_vec(),
                        failing_subject_id: subject_id.clone(),
                        cause: Box::new(cause),
                    });
                }
            }
        }

        info!(event_name = "approval.batch_applied", subjects = records.len(), "batch applied");
        Ok(BatchResult { event: request.event, records })
    }

    fn report(
        &self,
        context: &AuditContext,
        event: ApprovalEvent,
        subjects: &[SubjectId],
        result: &Result<BatchResult, BatchError>,
    ) {
        let audit_event = match result {
            Ok(batch) => AuditEvent::new(
                context,
                "approval.batch_applied",
                AuditCategory::Batch,
                AuditOutcome::Success,
            )
            .with_metadata("applied", batch.len().to_string()),
            Err(error) => {
                let (event_type, outcome) = match error {
                    BatchError::BatchValidationFailed { .. } | BatchError::Unauthorized { .. } => {
                        ("approval.batch_rejected", AuditOutcome::Rejected)
                    }
                    BatchError::Unavailable { .. } => {
                        ("approval.batch_rejected", AuditOutcome::Failed)
                    }
                    BatchError::PartialApplyFailure { .. } | BatchError::Cancelled { .. } => {
                        ("approval.batch_partial", AuditOutcome::Failed)
                    }
                };
                AuditEvent::new(context, event_type, AuditCategory::Batch, outcome)
                    .with_metadata("error_class", error.error_class())
                    .with_metadata("committed", error.committed().len().to_string())
                    .with_metadata("error", error.to_string())
            }
        };

        self.engine.audit_sink().emit(
            audit_event
                .with_metadata("event", event.as_str())
                .with_metadata("subjects", subjects.len().to_string()),
        );
    }
}

fn validation_failure(subject_id: &SubjectId, error: WorkflowError) -> BatchError {
    if error.is_retryable() {
        BatchError::Unavailable { subject_id: subject_id.clone(), cause: Box::new(error) }
    } else {
        BatchError::BatchValidationFailed {
            failing_subject_id: subject_id.clone(),
            reason: Box::new(error),
        }
    }
}
