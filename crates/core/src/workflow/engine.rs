use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use crate::config::WorkflowConfig;
use crate::domain::approval::{Actor, ApprovalEvent, ApprovalRecord, EventPayload, SubjectId};
use crate::errors::WorkflowError;
use crate::store::{ApprovalRecordStore, StoreError};
use crate::workflow::observer::{TransitionNotice, TransitionObserver};
use crate::workflow::table::{effective_transition, Transition};

/// Checks whether `actor` may apply `event` to `record` right now, without
/// touching any store. Checks run in a fixed order: table lookup, then
/// authorization, then payload.
pub fn validate_transition(
    record: &ApprovalRecord,
    event: ApprovalEvent,
    actor: &Actor,
    payload: &EventPayload,
) -> Result<Transition, WorkflowError> {
    let transition =
        effective_transition(record.state, record.resume_stage, event).ok_or_else(|| {
            WorkflowError::IllegalTransition {
                subject_id: record.subject_id.clone(),
                state: record.state,
                event,
            }
        })?;

    // A parked subject may only be moved by whoever it was handed to.
    let authorized = if record.state.is_redirect() {
        record.redirect_target() == Some(&actor.id)
    } else {
        transition.required.permits(record.state, &actor.role)
    };
    if !authorized {
        return Err(WorkflowError::Unauthorized {
            subject_id: record.subject_id.clone(),
            actor_id: actor.id.clone(),
            role: actor.role.clone(),
            event: Some(event),
        });
    }

    let invalid = |message: &str| WorkflowError::InvalidPayload {
        subject_id: record.subject_id.clone(),
        event,
        message: message.to_string(),
    };

    match event {
        ApprovalEvent::Reject => {
            let has_reason =
                payload.reason.as_deref().map(|reason| !reason.trim().is_empty()).unwrap_or(false);
            if !has_reason {
                return Err(invalid("a non-empty rejection reason is required"));
            }
        }
        ApprovalEvent::Delegate | ApprovalEvent::Escalate => match payload.target.as_ref() {
            None => return Err(invalid("a target actor is required")),
            Some(target) if target.as_str().trim().is_empty() => {
                return Err(invalid("the target actor must not be blank"));
            }
            Some(target) if *target == actor.id => {
                return Err(invalid("the target actor must differ from the acting actor"));
            }
            Some(_) => {}
        },
        ApprovalEvent::ManagerApprove | ApprovalEvent::HrApprove | ApprovalEvent::FinanceApprove => {}
    }

    Ok(transition)
}

/// Applies one event to one subject at a time on top of an
/// [`ApprovalRecordStore`].
pub struct WorkflowEngine<S> {
    store: Arc<S>,
    config: WorkflowConfig,
    observers: Vec<Arc<dyn TransitionObserver>>,
    audit: Arc<dyn AuditSink>,
}

impl<S> WorkflowEngine<S>
where
    S: ApprovalRecordStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, WorkflowConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: WorkflowConfig) -> Self {
        Self { store, config, observers: Vec::new(), audit: Arc::new(NoopAuditSink) }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub(crate) fn audit_sink(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }

    /// Current record of a subject; a subject never seen before is `PENDING`.
    pub async fn record(&self, subject_id: &SubjectId) -> Result<ApprovalRecord, WorkflowError> {
        self.load_record(subject_id).await
    }

    /// Loads the subject and validates the event against it without writing.
    pub async fn preflight(
        &self,
        subject_id: &SubjectId,
        event: ApprovalEvent,
        actor: &Actor,
        payload: &EventPayload,
    ) -> Result<ApprovalRecord, WorkflowError> {
        let record = self.load_record(subject_id).await?;
        validate_transition(&record, event, actor, payload)?;
        Ok(record)
    }

    pub async fn apply(
        &self,
        subject_id: &SubjectId,
        event: ApprovalEvent,
        actor: &Actor,
        payload: &EventPayload,
    ) -> Result<ApprovalRecord, WorkflowError> {
        let correlation_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "approval.apply",
            subject_id = %subject_id,
            event = event.as_str(),
            actor_id = %actor.id,
            correlation_id = %correlation_id,
        );

        let result = self
            .apply_with_retry(subject_id, event, actor, payload, &correlation_id)
            .instrument(span)
            .await;

        let context =
            AuditContext::new(Some(subject_id.clone()), correlation_id, actor.id.as_str());
        self.report_attempt(&context, event, &result);
        result
    }

    async fn apply_with_retry(
        &self,
        subject_id: &SubjectId,
        event: ApprovalEvent,
        actor: &Actor,
        payload: &EventPayload,
        correlation_id: &str,
    ) -> Result<ApprovalRecord, WorkflowError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let current = self.load_record(subject_id).await?;
            let transition = validate_transition(&current, event, actor, payload)?;
            let next = current.advance(event, transition.to, actor, payload, Utc::now());

            match self.timed(self.store.compare_and_swap(current.version, next.clone())).await {
                Ok(()) => {
                    info!(
                        event_name = "approval.transition_applied",
                        from = current.state.as_str(),
                        to = next.state.as_str(),
                        version = next.version,
                        "transition applied"
                    );
                    self.notify(&current, &next, event, actor, payload, correlation_id);
                    return Ok(next);
                }
                Err(StoreError::Conflict { expected, actual, .. }) => {
                    if attempt >= max_attempts {
                        return Err(WorkflowError::Contended {
                            subject_id: subject_id.clone(),
                            attempts: attempt,
                        });
                    }
                    debug!(
                        event_name = "approval.version_conflict",
                        expected,
                        actual,
                        attempt,
                        "record changed concurrently, re-validating"
                    );
                }
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    warn!(
                        event_name = "approval.store_retry",
                        attempt,
                        error = %error,
                        "transient store fault on write, backing off"
                    );
                    tokio::time::sleep(self.config.backoff_delay(attempt)).await;
                }
                Err(error) => return Err(storage_failure(subject_id, error, attempt)),
            }
        }
    }

    async fn load_record(&self, subject_id: &SubjectId) -> Result<ApprovalRecord, WorkflowError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.timed(self.store.load(subject_id)).await {
                Ok(Some(record)) => {
                    record.verify_projection().map_err(|error| WorkflowError::CorruptRecord {
                        subject_id: subject_id.clone(),
                        message: error.to_string(),
                    })?;
                    return Ok(record);
                }
                Ok(None) => return Ok(ApprovalRecord::pending(subject_id.clone())),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    warn!(
                        event_name = "approval.store_retry",
                        subject_id = %subject_id,
                        attempt,
                        error = %error,
                        "transient store fault on read, backing off"
                    );
                    tokio::time::sleep(self.config.backoff_delay(attempt)).await;
                }
                Err(error) => return Err(storage_failure(subject_id, error, attempt)),
            }
        }
    }

    async fn timed<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.store_timeout(), operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    fn notify(
        &self,
        previous: &ApprovalRecord,
        next: &ApprovalRecord,
        event: ApprovalEvent,
        actor: &Actor,
        payload: &EventPayload,
        correlation_id: &str,
    ) {
        if self.observers.is_empty() {
            return;
        }

        let notice = TransitionNotice {
            subject_id: next.subject_id.clone(),
            event,
            from: previous.state,
            to: next.state,
            actor: actor.clone(),
            payload: payload.clone(),
            version: next.version,
            correlation_id: correlation_id.to_string(),
        };

        for observer in &self.observers {
            if let Err(error) = observer.on_transition(&notice) {
                warn!(
                    event_name = "approval.observer_failed",
                    observer = %error.observer,
                    error = %error,
                    "transition observer failed; transition stays committed"
                );
            }
        }
    }

    fn report_attempt(
        &self,
        context: &AuditContext,
        event: ApprovalEvent,
        result: &Result<ApprovalRecord, WorkflowError>,
    ) {
        let audit_event = match result {
            Ok(record) => AuditEvent::new(
                context,
                "approval.transition_applied",
                AuditCategory::Workflow,
                AuditOutcome::Success,
            )
            .with_metadata("to", record.state.as_str())
            .with_metadata("version", record.version.to_string()),
            Err(error) => {
                let (event_type, category, outcome) = match error {
                    WorkflowError::CorruptRecord { .. } => (
                        "approval.transition_failed",
                        AuditCategory::Persistence,
                        AuditOutcome::Failed,
                    ),
                    error if error.is_retryable() => (
                        "approval.transition_failed",
                        AuditCategory::Persistence,
                        AuditOutcome::Failed,
                    ),
                    _ => (
                        "approval.transition_rejected",
                        AuditCategory::Workflow,
                        AuditOutcome::Rejected,
                    ),
                };
                AuditEvent::new(context, event_type, category, outcome)
                    .with_metadata("error_class", error.error_class())
                    .with_metadata("error", error.to_string())
            }
        };

        self.audit.emit(audit_event.with_metadata("event", event.as_str()));
    }
}

fn storage_failure(subject_id: &SubjectId, error: StoreError, attempts: u32) -> WorkflowError {
    match error {
        StoreError::Timeout => WorkflowError::StoreTimeout { subject_id: subject_id.clone(), attempts },
        StoreError::Unavailable(message) => {
            WorkflowError::StoreUnavailable { subject_id: subject_id.clone(), attempts, message }
        }
        StoreError::Conflict { .. } => {
            WorkflowError::Contended { subject_id: subject_id.clone(), attempts }
        }
        StoreError::Decode(message) | StoreError::RewritesHistory { message, .. } => {
            WorkflowError::CorruptRecord { subject_id: subject_id.clone(), message }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::audit::{AuditOutcome, InMemoryAuditSink};
    use crate::config::WorkflowConfig;
    use crate::domain::approval::{
        Actor, ActorId, ActorRole, ApprovalEvent, ApprovalRecord, ApprovalState, EventPayload,
        SubjectId,
    };
    use crate::errors::WorkflowError;
    use crate::store::{ApprovalRecordStore, InMemoryApprovalStore, StoreError};
    use crate::workflow::engine::WorkflowEngine;
    use crate::workflow::observer::{
        ObserverError, RecordingObserver, TransitionNotice, TransitionObserver,
    };

    fn manager() -> Actor {
        Actor::new("mgr-1", ActorRole::Manager)
    }

    fn hr() -> Actor {
        Actor::new("hr-1", ActorRole::Hr)
    }

    fn finance() -> Actor {
        Actor::new("fin-1", ActorRole::Finance)
    }

    fn fast_config() -> WorkflowConfig {
        WorkflowConfig {
            max_attempts: 3,
            retry_base_delay_ms: 1,
            retry_backoff_multiplier: 2,
            store_timeout_ms: 50,
        }
    }

    fn engine() -> WorkflowEngine<InMemoryApprovalStore> {
        WorkflowEngine::with_config(Arc::new(InMemoryApprovalStore::new()), fast_config())
    }

    fn none() -> EventPayload {
        EventPayload::default()
    }

    #[tokio::test]
    async fn happy_path_walks_the_full_chain() {
        let engine = engine();
        let subject = SubjectId::new("TE-100");

        let record =
            engine.apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none()).await;
        assert_eq!(record.expect("manager approve").state, ApprovalState::ManagerApproved);

        let record = engine.apply(&subject, ApprovalEvent::HrApprove, &hr(), &none()).await;
        assert_eq!(record.expect("hr approve").state, ApprovalState::HrApproved);

        let record = engine
            .apply(&subject, ApprovalEvent::FinanceApprove, &finance(), &none())
            .await
            .expect("finance approve");
        assert_eq!(record.state, ApprovalState::FinanceApproved);
        assert_eq!(record.version, 3);
        assert_eq!(record.audit_log.len(), 3);
        assert_eq!(record.verify_projection(), Ok(()));

        for event in ApprovalEvent::ALL {
            let error = engine
                .apply(&subject, event, &finance(), &EventPayload::reason("late"))
                .await
                .expect_err("terminal state");
            assert!(matches!(
                error,
                WorkflowError::IllegalTransition { state: ApprovalState::FinanceApproved, .. }
            ));
        }
    }

    #[tokio::test]
    async fn wrong_role_is_unauthorized_and_leaves_subject_pending() {
        let engine = engine();
        let subject = SubjectId::new("TE-101");

        let error = engine
            .apply(&subject, ApprovalEvent::ManagerApprove, &hr(), &none())
            .await
            .expect_err("hr cannot manager-approve");
        assert!(matches!(error, WorkflowError::Unauthorized { .. }));

        let record = engine.record(&subject).await.expect("record");
        assert_eq!(record.state, ApprovalState::Pending);
        assert!(!record.is_persisted());
    }

    #[tokio::test]
    async fn rejection_requires_a_reason() {
        let engine = engine();
        let subject = SubjectId::new("TE-102");

        let missing = engine
            .apply(&subject, ApprovalEvent::Reject, &manager(), &none())
            .await
            .expect_err("missing reason");
        assert!(matches!(missing, WorkflowError::InvalidPayload { .. }));

        let blank = engine
            .apply(&subject, ApprovalEvent::Reject, &manager(), &EventPayload::reason("   "))
            .await
            .expect_err("blank reason");
        assert!(matches!(blank, WorkflowError::InvalidPayload { .. }));

        let record = engine
            .apply(
                &subject,
                ApprovalEvent::Reject,
                &manager(),
                &EventPayload::reason("incomplete timesheet"),
            )
            .await
            .expect("reject");
        assert_eq!(record.state, ApprovalState::Rejected);
        assert!(record.state.is_terminal());
        assert_eq!(record.audit_log[0].payload.reason.as_deref(), Some("incomplete timesheet"));
    }

    #[tokio::test]
    async fn any_assigned_reviewer_may_reject_but_others_may_not() {
        let engine = engine();
        let subject = SubjectId::new("TE-103");

        let outsider = Actor::new("aud-1", ActorRole::Reviewer("auditor".to_string()));
        let error = engine
            .apply(&subject, ApprovalEvent::Reject, &outsider, &EventPayload::reason("no"))
            .await
            .expect_err("unassigned reviewer");
        assert!(matches!(error, WorkflowError::Unauthorized { .. }));

        let record = engine
            .apply(&subject, ApprovalEvent::Reject, &finance(), &EventPayload::reason("budget"))
            .await
            .expect("finance may reject a pending entry");
        assert_eq!(record.state, ApprovalState::Rejected);
    }

    #[tokio::test]
    async fn delegation_requires_distinct_target_and_current_reviewer() {
        let engine = engine();
        let subject = SubjectId::new("TE-104");

        let missing = engine
            .apply(&subject, ApprovalEvent::Delegate, &manager(), &none())
            .await
            .expect_err("missing target");
        assert!(matches!(missing, WorkflowError::InvalidPayload { .. }));

        let self_target = engine
            .apply(&subject, ApprovalEvent::Delegate, &manager(), &EventPayload::target("mgr-1"))
            .await
            .expect_err("self delegation");
        assert!(matches!(self_target, WorkflowError::InvalidPayload { .. }));

        let not_current = engine
            .apply(&subject, ApprovalEvent::Escalate, &hr(), &EventPayload::target("dir-1"))
            .await
            .expect_err("hr is not the current reviewer of a pending entry");
        assert!(matches!(not_current, WorkflowError::Unauthorized { .. }));

        let record = engine
            .apply(&subject, ApprovalEvent::Delegate, &manager(), &EventPayload::target("mgr-2"))
            .await
            .expect("delegate");
        assert_eq!(record.state, ApprovalState::Delegated);
        assert_eq!(record.delegated_to, Some(ActorId::new("mgr-2")));
        assert_eq!(record.resume_stage, Some(ApprovalState::Pending));
    }

    #[tokio::test]
    async fn delegate_resumes_the_parked_stage() {
        let engine = engine();
        let subject = SubjectId::new("TE-105");
        let delegate = Actor::new("mgr-2", ActorRole::Manager);

        engine
            .apply(&subject, ApprovalEvent::Delegate, &manager(), &EventPayload::target("mgr-2"))
            .await
            .expect("delegate");

        let original = engine
            .apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none())
            .await
            .expect_err("delegator no longer holds the entry");
        assert!(matches!(original, WorkflowError::Unauthorized { .. }));

        let skipped = engine
            .apply(&subject, ApprovalEvent::HrApprove, &delegate, &none())
            .await
            .expect_err("cannot skip the parked stage");
        assert!(matches!(
            skipped,
            WorkflowError::IllegalTransition { state: ApprovalState::Delegated, .. }
        ));

        let record = engine
            .apply(&subject, ApprovalEvent::ManagerApprove, &delegate, &none())
            .await
            .expect("delegate approves");
        assert_eq!(record.state, ApprovalState::ManagerApproved);
        assert_eq!(record.delegated_to, None);
        assert_eq!(record.resume_stage, None);
        assert_eq!(record.verify_projection(), Ok(()));
    }

    #[tokio::test]
    async fn escalation_target_can_reject_or_re_delegate() {
        let engine = engine();
        let subject = SubjectId::new("TE-106");
        let director = Actor::new("dir-1", ActorRole::Reviewer("director".to_string()));

        engine.apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none()).await.expect("m");
        engine
            .apply(&subject, ApprovalEvent::Escalate, &hr(), &EventPayload::target("dir-1"))
            .await
            .expect("escalate");

        let record = engine
            .apply(&subject, ApprovalEvent::Delegate, &director, &EventPayload::target("hr-2"))
            .await
            .expect("escalation target re-delegates");
        assert_eq!(record.state, ApprovalState::Delegated);
        assert_eq!(record.resume_stage, Some(ApprovalState::ManagerApproved));

        let record = engine
            .apply(
                &subject,
                ApprovalEvent::Reject,
                &Actor::new("hr-2", ActorRole::Hr),
                &EventPayload::reason("hours exceed contract"),
            )
            .await
            .expect("delegate rejects");
        assert_eq!(record.state, ApprovalState::Rejected);
        assert_eq!(record.verify_projection(), Ok(()));
    }

    #[tokio::test]
    async fn illegal_event_never_mutates_the_stored_record() {
        let engine = engine();
        let subject = SubjectId::new("TE-107");
        engine.apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none()).await.expect("m");
        let before = engine.store().load(&subject).await.expect("load");

        let _ = engine.apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none()).await;
        let _ = engine.apply(&subject, ApprovalEvent::FinanceApprove, &finance(), &none()).await;
        let _ = engine.apply(&subject, ApprovalEvent::Reject, &hr(), &none()).await;

        let after = engine.store().load(&subject).await.expect("load");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn every_attempt_reaches_the_audit_sink() {
        let sink = InMemoryAuditSink::default();
        let engine = engine().with_audit_sink(Arc::new(sink.clone()));
        let subject = SubjectId::new("TE-108");

        engine.apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none()).await.expect("m");
        let _ = engine.apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none()).await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "approval.transition_applied");
        assert_eq!(events[0].outcome, AuditOutcome::Success);
        assert_eq!(events[1].event_type, "approval.transition_rejected");
        assert_eq!(events[1].metadata.get("error_class").map(String::as_str), Some("illegal_transition"));
        assert_ne!(events[0].correlation_id, events[1].correlation_id);
    }

    struct FailingObserver;

    impl TransitionObserver for FailingObserver {
        fn on_transition(&self, _notice: &TransitionNotice) -> Result<(), ObserverError> {
            Err(ObserverError::new("mailer", "smtp unreachable"))
        }
    }

    #[tokio::test]
    async fn observer_failure_does_not_roll_back_or_propagate() {
        let recorder = RecordingObserver::default();
        let engine = engine()
            .with_observer(Arc::new(FailingObserver))
            .with_observer(Arc::new(recorder.clone()));
        let subject = SubjectId::new("TE-109");

        let record = engine
            .apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none())
            .await
            .expect("observer errors are swallowed");
        assert_eq!(record.state, ApprovalState::ManagerApproved);

        let stored = engine.store().load(&subject).await.expect("load").expect("persisted");
        assert_eq!(stored.state, ApprovalState::ManagerApproved);

        let notices = recorder.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].from, ApprovalState::Pending);
        assert_eq!(notices[0].to, ApprovalState::ManagerApproved);
        assert_eq!(notices[0].version, 1);
    }

    #[tokio::test]
    async fn transient_write_faults_are_retried() {
        let engine = engine();
        let subject = SubjectId::new("TE-110");
        engine.store().inject_write_faults(
            subject.clone(),
            StoreError::Unavailable("database is locked".to_string()),
            2,
        );

        let record = engine
            .apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none())
            .await
            .expect("third attempt succeeds");
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn persistent_write_faults_surface_after_bounded_retries() {
        let engine = engine();
        let subject = SubjectId::new("TE-111");
        engine.store().inject_write_faults(
            subject.clone(),
            StoreError::Unavailable("database is locked".to_string()),
            10,
        );

        let error = engine
            .apply(&subject, ApprovalEvent::ManagerApprove, &manager(), &none())
            .await
            .expect_err("retries exhausted");
        assert!(matches!(error, WorkflowError::StoreUnavailable { attempts: 3, .. }));
        assert!(error.is_retryable());
        assert_eq!(engine.record(&subject).await.expect("record").state, ApprovalState::Pending);
    }

    struct StalledStore {
        inner: InMemoryApprovalStore,
    }

    #[async_trait]
    impl ApprovalRecordStore for StalledStore {
        async fn load(
            &self,
            subject_id: &SubjectId,
        ) -> Result<Option<ApprovalRecord>, StoreError> {
            self.inner.load(subject_id).await
        }

        async fn compare_and_swap(
            &self,
            expected_version: u64,
            record: ApprovalRecord,
        ) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.inner.compare_and_swap(expected_version, record).await
        }

        async fn list_subjects(&self) -> Result<Vec<SubjectId>, StoreError> {
            self.inner.list_subjects().await
        }
    }

    #[tokio::test]
    async fn stalled_store_surfaces_store_timeout() {
        let store = Arc::new(StalledStore { inner: InMemoryApprovalStore::new() });
        let engine = WorkflowEngine::with_config(
            store,
            WorkflowConfig { max_attempts: 2, store_timeout_ms: 20, ..fast_config() },
        );

        let error = engine
            .apply(&SubjectId::new("TE-112"), ApprovalEvent::ManagerApprove, &manager(), &none())
            .await
            .expect_err("write never completes");
        assert_eq!(
            error,
            WorkflowError::StoreTimeout { subject_id: SubjectId::new("TE-112"), attempts: 2 }
        );
    }

    #[tokio::test]
    async fn corrupt_stored_record_is_reported() {
        let engine = engine();
        let subject = SubjectId::new("TE-113");
        let mut record = ApprovalRecord::pending(subject.clone()).advance(
            ApprovalEvent::ManagerApprove,
            ApprovalState::ManagerApproved,
            &manager(),
            &none(),
            Utc::now(),
        );
        record.state = ApprovalState::HrApproved;
        engine.store().compare_and_swap(0, record).await.expect("plant record");

        let error = engine
            .apply(&subject, ApprovalEvent::FinanceApprove, &finance(), &none())
            .await
            .expect_err("projection does not match log");
        assert!(matches!(error, WorkflowError::CorruptRecord { .. }));
    }
}
