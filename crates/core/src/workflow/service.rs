use std::sync::Arc;

use crate::domain::approval::{
    Actor, ActorId, ActorRole, ApprovalEvent, ApprovalRecord, EventPayload, SubjectId,
};
use crate::errors::{BatchError, WorkflowError};
use crate::store::ApprovalRecordStore;
use crate::workflow::batch::{BatchCoordinator, BatchRequest, BatchResult, CancellationFlag};
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::table::stage_reviewer;

/// The approval event a role raises when it approves, if it has a stage.
pub fn role_to_event(role: &ActorRole) -> Option<ApprovalEvent> {
    match role {
        ActorRole::Manager => Some(ApprovalEvent::ManagerApprove),
        ActorRole::Hr => Some(ApprovalEvent::HrApprove),
        ActorRole::Finance => Some(ApprovalEvent::FinanceApprove),
        ActorRole::Reviewer(_) => None,
    }
}

/// The approval event `actor` raises on `record`. The target of a delegated
/// or escalated entry approves the parked stage on the delegator's
/// authority, whatever their own role.
pub fn approval_event_for(record: &ApprovalRecord, actor: &Actor) -> Option<ApprovalEvent> {
    if record.state.is_redirect() && record.redirect_target() == Some(&actor.id) {
        return record.resume_stage.and_then(stage_reviewer).as_ref().and_then(role_to_event);
    }
    role_to_event(&actor.role)
}

/// Entry point used by request adapters.
pub struct ApprovalService<S> {
    engine: Arc<WorkflowEngine<S>>,
    batches: BatchCoordinator<S>,
}

impl<S> ApprovalService<S>
where
    S: ApprovalRecordStore,
{
    pub fn new(engine: WorkflowEngine<S>) -> Self {
        let engine = Arc::new(engine);
        Self { batches: BatchCoordinator::new(Arc::clone(&engine)), engine }
    }

    pub fn engine(&self) -> &WorkflowEngine<S> {
        &self.engine
    }

    pub async fn record(&self, subject_id: &SubjectId) -> Result<ApprovalRecord, WorkflowError> {
        self.engine.record(subject_id).await
    }

    pub async fn approve(
        &self,
        subject_id: &SubjectId,
        actor: &Actor,
    ) -> Result<ApprovalRecord, WorkflowError> {
        let current = self.engine.record(subject_id).await?;
        let event =
            approval_event_for(&current, actor).ok_or_else(|| WorkflowError::Unauthorized {
                subject_id: subject_id.clone(),
                actor_id: actor.id.clone(),
                role: actor.role.clone(),
                event: None,
            })?;
        self.engine.apply(subject_id, event, actor, &EventPayload::default()).await
    }

    pub async fn reject(
        &self,
        subject_id: &SubjectId,
        actor: &Actor,
        reason: impl Into<String>,
    ) -> Result<ApprovalRecord, WorkflowError> {
        self.engine
            .apply(subject_id, ApprovalEvent::Reject, actor, &EventPayload::reason(reason))
            .await
    }

    pub async fn delegate(
        &self,
        subject_id: &SubjectId,
        actor: &Actor,
        target: &ActorId,
    ) -> Result<ApprovalRecord, WorkflowError> {
        let payload = EventPayload { reason: None, target: Some(target.clone()) };
        self.engine.apply(subject_id, ApprovalEvent::Delegate, actor, &payload).await
    }

    pub async fn escalate(
        &self,
        subject_id: &SubjectId,
        actor: &Actor,
        target: &ActorId,
    ) -> Result<ApprovalRecord, WorkflowError> {
        let payload = EventPayload { reason: None, target: Some(target.clone()) };
        self.engine.apply(subject_id, ApprovalEvent::Escalate, actor, &payload).await
    }

    pub async fn approve_bulk(
        &self,
        subject_ids: &[SubjectId],
        actor: &Actor,
    ) -> Result<BatchResult, BatchError> {
        self.approve_bulk_with_cancellation(subject_ids, actor, &CancellationFlag::new()).await
    }

    /// Bulk approval raises the single event of the actor's own role. A parked
    /// entry is included only when that event resumes its stage; a redirect
    /// target without a stage role approves parked entries one at a time.
    pub async fn approve_bulk_with_cancellation(
        &self,
        subject_ids: &[SubjectId],
        actor: &Actor,
        cancellation: &CancellationFlag,
    ) -> Result<BatchResult, BatchError> {
        let event = role_to_event(&actor.role).ok_or_else(|| BatchError::Unauthorized {
            actor_id: actor.id.clone(),
            role: actor.role.clone(),
        })?;
        let request = BatchRequest::new(subject_ids.to_vec(), event, actor.clone());
        self.batches.apply_batch_with_cancellation(&request, cancellation).await
    }
}
