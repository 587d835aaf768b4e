pub mod batch;
pub mod engine;
pub mod observer;
pub mod service;
pub mod table;

pub use batch::{BatchCoordinator, BatchRequest, BatchResult, CancellationFlag};
pub use engine::{validate_transition, WorkflowEngine};
pub use observer::{
    ObserverError, RecordingObserver, TracingObserver, TransitionNotice, TransitionObserver,
};
pub use service::{approval_event_for, role_to_event, ApprovalService};
pub use table::{allowed_transition, effective_transition, RequiredRoles, Transition, TRANSITIONS};
