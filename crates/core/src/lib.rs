pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod store;
pub mod workflow;

pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, NoopAuditSink, TracingAuditSink};
pub use config::{AppConfig, ConfigError, LoadOptions, WorkflowConfig};
pub use domain::approval::{
    Actor, ActorId, ActorRole, ApprovalEvent, ApprovalRecord, ApprovalState, AuditEntry,
    EventPayload, SubjectId,
};
pub use errors::{ApplicationError, BatchError, InterfaceError, WorkflowError};
pub use store::{ApprovalRecordStore, InMemoryApprovalStore, StoreError};
pub use workflow::{
    ApprovalService, BatchCoordinator, BatchRequest, BatchResult, CancellationFlag,
    TransitionObserver, WorkflowEngine,
};
