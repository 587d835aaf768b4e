use thiserror::Error;

use crate::domain::approval::{ActorId, ActorRole, ApprovalEvent, ApprovalState, SubjectId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("{event} is not permitted from {state} for subject {subject_id}")]
    IllegalTransition { subject_id: SubjectId, state: ApprovalState, event: ApprovalEvent },
    #[error(
        "actor `{actor_id}` with role {role} may not apply {} to subject {subject_id}",
        .event.map(|event| event.as_str()).unwrap_or("an approval")
    )]
    Unauthorized {
        subject_id: SubjectId,
        actor_id: ActorId,
        role: ActorRole,
        event: Option<ApprovalEvent>,
    },
    #[error("invalid payload for {event} on subject {subject_id}: {message}")]
    InvalidPayload { subject_id: SubjectId, event: ApprovalEvent, message: String },
    #[error("approval store timed out for subject {subject_id} after {attempts} attempt(s)")]
    StoreTimeout { subject_id: SubjectId, attempts: u32 },
    #[error("approval store unavailable for subject {subject_id} after {attempts} attempt(s): {message}")]
    StoreUnavailable { subject_id: SubjectId, attempts: u32, message: String },
    #[error("subject {subject_id} was still contended after {attempts} attempt(s)")]
    Contended { subject_id: SubjectId, attempts: u32 },
    #[error("approval record for subject {subject_id} is corrupt: {message}")]
    CorruptRecord { subject_id: SubjectId, message: String },
}

impl WorkflowError {
    pub fn subject_id(&self) -> &SubjectId {
        match self {
            Self::IllegalTransition { subject_id, .. }
            | Self::Unauthorized { subject_id, .. }
            | Self::InvalidPayload { subject_id, .. }
            | Self::StoreTimeout { subject_id, .. }
            | Self::StoreUnavailable { subject_id, .. }
            | Self::Contended { subject_id, .. }
            | Self::CorruptRecord { subject_id, .. } => subject_id,
        }
    }

    /// Storage-layer failures; every other variant is a business-rule
    /// rejection that retrying cannot fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreTimeout { .. } | Self::StoreUnavailable { .. } | Self::Contended { .. }
        )
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::StoreTimeout { .. } => "store_timeout",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::Contended { .. } => "contended",
            Self::CorruptRecord { .. } => "corrupt_record",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch rejected: subject {failing_subject_id} failed validation: {reason}")]
    BatchValidationFailed { failing_subject_id: SubjectId, reason: Box<WorkflowError> },
    #[error(
        "batch partially applied ({} committed, {} not applied): subject {failing_subject_id} failed: {cause}",
        .committed.len(),
        .failed.len()
    )]
    PartialApplyFailure {
        committed: Vec<SubjectId>,
        failed: Vec<SubjectId>,
        failing_subject_id: SubjectId,
        cause: Box<WorkflowError>,
    },
    #[error("batch aborted before any write while reading subject {subject_id}: {cause}")]
    Unavailable { subject_id: SubjectId, cause: Box<WorkflowError> },
    #[error("batch cancelled ({} committed, {} skipped)", .committed.len(), .skipped.len())]
    Cancelled { committed: Vec<SubjectId>, skipped: Vec<SubjectId> },
    #[error("actor `{actor_id}` with role {role} has no approval stage to bulk-approve")]
    Unauthorized { actor_id: ActorId, role: ActorRole },
}

impl BatchError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::BatchValidationFailed { .. } => "batch_validation_failed",
            Self::PartialApplyFailure { .. } => "partial_apply_failure",
            Self::Unavailable { .. } => "store_unavailable",
            Self::Cancelled { .. } => "cancelled",
            Self::Unauthorized { .. } => "unauthorized",
        }
    }

    /// Subjects whose transition is durably committed despite the error.
    pub fn committed(&self) -> &[SubjectId] {
        match self {
            Self::PartialApplyFailure { committed, .. } | Self::Cancelled { committed, .. } => {
                committed
            }
            Self::BatchValidationFailed { .. }
            | Self::Unavailable { .. }
            | Self::Unauthorized { .. } => &[],
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("schema migration failed: {0}")]
    Migration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("partially applied: {message}")]
    PartiallyApplied {
        message: String,
        committed: Vec<String>,
        failed: Vec<String>,
        correlation_id: String,
    },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not permitted to perform this approval action.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::PartiallyApplied { .. } => {
                "Some entries were updated before a failure. Retry only the entries listed as failed."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::PartiallyApplied { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Workflow(error) => error.error_class(),
            Self::Batch(error) => error.error_class(),
            Self::Persistence(_) => "db_connectivity",
            Self::Migration(_) => "migration",
            Self::Configuration(_) => "config_validation",
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::PartiallyApplied { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

fn unassigned() -> String {
    "unassigned".to_owned()
}

fn ids(subjects: &[SubjectId]) -> Vec<String> {
    subjects.iter().map(|subject| subject.0.clone()).collect()
}

impl From<WorkflowError> for InterfaceError {
    fn from(value: WorkflowError) -> Self {
        let message = value.to_string();
        match value {
            WorkflowError::IllegalTransition { .. } | WorkflowError::InvalidPayload { .. } => {
                Self::BadRequest { message, correlation_id: unassigned() }
            }
            WorkflowError::Unauthorized { .. } => {
                Self::Forbidden { message, correlation_id: unassigned() }
            }
            WorkflowError::StoreTimeout { .. }
            | WorkflowError::StoreUnavailable { .. }
            | WorkflowError::Contended { .. } => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            WorkflowError::CorruptRecord { .. } => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Workflow(error) => Self::from(error),
            ApplicationError::Batch(error) => {
                let message = error.to_string();
                match error {
                    BatchError::BatchValidationFailed { .. } => {
                        Self::BadRequest { message, correlation_id: unassigned() }
                    }
                    BatchError::PartialApplyFailure { committed, failed, .. } => {
                        Self::PartiallyApplied {
                            message,
                            committed: ids(&committed),
                            failed: ids(&failed),
                            correlation_id: unassigned(),
                        }
                    }
                    BatchError::Cancelled { committed, skipped } => Self::PartiallyApplied {
                        message,
                        committed: ids(&committed),
                        failed: ids(&skipped),
                        correlation_id: unassigned(),
                    },
                    BatchError::Unavailable { .. } => {
                        Self::ServiceUnavailable { message, correlation_id: unassigned() }
                    }
                    BatchError::Unauthorized { .. } => {
                        Self::Forbidden { message, correlation_id: unassigned() }
                    }
                }
            }
            ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Migration(message) | ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}
