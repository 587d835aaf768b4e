use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::approval::{Actor, ApprovalEvent, ApprovalState, EventPayload, SubjectId};

/// Emitted once per committed transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionNotice {
    pub subject_id: SubjectId,
    pub event: ApprovalEvent,
    pub from: ApprovalState,
    pub to: ApprovalState,
    pub actor: Actor,
    pub payload: EventPayload,
    pub version: u64,
    pub correlation_id: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("observer `{observer}` failed: {message}")]
pub struct ObserverError {
    pub observer: String,
    pub message: String,
}

impl ObserverError {
    pub fn new(observer: impl Into<String>, message: impl Into<String>) -> Self {
        Self { observer: observer.into(), message: message.into() }
    }
}

/// Hook for side effects such as notifications. Runs after the transition
/// is durable; a failure here is logged and never undoes the transition.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, notice: &TransitionNotice) -> Result<(), ObserverError>;
}

/// Logs every committed transition; stands in for a notification channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl TransitionObserver for TracingObserver {
    fn on_transition(&self, notice: &TransitionNotice) -> Result<(), ObserverError> {
        tracing::info!(
            event_name = "approval.notification",
            subject_id = %notice.subject_id,
            event = notice.event.as_str(),
            from = notice.from.as_str(),
            to = notice.to.as_str(),
            actor_id = %notice.actor.id,
            correlation_id = %notice.correlation_id,
            "transition notification"
        );
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingObserver {
    notices: Arc<Mutex<Vec<TransitionNotice>>>,
}

impl RecordingObserver {
    pub fn notices(&self) -> Vec<TransitionNotice> {
        match self.notices.lock() {
            Ok(notices) => notices.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TransitionObserver for RecordingObserver {
    fn on_transition(&self, notice: &TransitionNotice) -> Result<(), ObserverError> {
        match self.notices.lock() {
            Ok(mut notices) => notices.push(notice.clone()),
            Err(poisoned) => poisoned.into_inner().push(notice.clone()),
        }
        Ok(())
    }
}
