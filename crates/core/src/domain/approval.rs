use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::table::effective_transition;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const REVIEWER_KEY_PREFIX: &str = "REVIEWER:";

/// Capacity under which a caller invokes a transition. Role identity is
/// supplied by the caller and trusted as-is.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorRole {
    Manager,
    Hr,
    Finance,
    Reviewer(String),
}

impl ActorRole {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Manager => "MANAGER",
            Self::Hr => "HR",
            Self::Finance => "FINANCE",
            Self::Reviewer(name) => name.as_str(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }

        match trimmed.to_ascii_uppercase().as_str() {
            "MANAGER" => Some(Self::Manager),
            "HR" => Some(Self::Hr),
            "FINANCE" => Some(Self::Finance),
            _ => Some(Self::Reviewer(trimmed.to_string())),
        }
    }

    /// Lossless form for persistence. Reviewer names are tagged so a
    /// reviewer called "manager" never reloads as the manager stage role.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Reviewer(name) => format!("{REVIEWER_KEY_PREFIX}{name}"),
            stage => stage.as_str().to_string(),
        }
    }

    pub fn from_storage_key(value: &str) -> Option<Self> {
        match value {
            "MANAGER" => Some(Self::Manager),
            "HR" => Some(Self::Hr),
            "FINANCE" => Some(Self::Finance),
            _ => value
                .strip_prefix(REVIEWER_KEY_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| Self::Reviewer(name.to_string())),
        }
    }

    /// Whether the role belongs to one of the three review stages.
    pub fn is_assigned_reviewer(&self) -> bool {
        matches!(self, Self::Manager | Self::Hr | Self::Finance)
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: ActorRole) -> Self {
        Self { id: ActorId::new(id), role }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    Pending,
    ManagerApproved,
    HrApproved,
    FinanceApproved,
    Rejected,
    Delegated,
    Escalated,
}

impl ApprovalState {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::ManagerApproved,
        Self::HrApproved,
        Self::FinanceApproved,
        Self::Rejected,
        Self::Delegated,
        Self::Escalated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::ManagerApproved => "MANAGER_APPROVED",
            Self::HrApproved => "HR_APPROVED",
            Self::FinanceApproved => "FINANCE_APPROVED",
            Self::Rejected => "REJECTED",
            Self::Delegated => "DELEGATED",
            Self::Escalated => "ESCALATED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "MANAGER_APPROVED" => Some(Self::ManagerApproved),
            "HR_APPROVED" => Some(Self::HrApproved),
            "FINANCE_APPROVED" => Some(Self::FinanceApproved),
            "REJECTED" => Some(Self::Rejected),
            "DELEGATED" => Some(Self::Delegated),
            "ESCALATED" => Some(Self::Escalated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinanceApproved | Self::Rejected)
    }

    /// Delegated and escalated subjects are parked on a redirect target and
    /// resume the stage they were raised from.
    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Delegated | Self::Escalated)
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalEvent {
    ManagerApprove,
    HrApprove,
    FinanceApprove,
    Reject,
    Delegate,
    Escalate,
}

impl ApprovalEvent {
    pub const ALL: [Self; 6] = [
        Self::ManagerApprove,
        Self::HrApprove,
        Self::FinanceApprove,
        Self::Reject,
        Self::Delegate,
        Self::Escalate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManagerApprove => "MANAGER_APPROVE",
            Self::HrApprove => "HR_APPROVE",
            Self::FinanceApprove => "FINANCE_APPROVE",
            Self::Reject => "REJECT",
            Self::Delegate => "DELEGATE",
            Self::Escalate => "ESCALATE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MANAGER_APPROVE" => Some(Self::ManagerApprove),
            "HR_APPROVE" => Some(Self::HrApprove),
            "FINANCE_APPROVE" => Some(Self::FinanceApprove),
            "REJECT" => Some(Self::Reject),
            "DELEGATE" => Some(Self::Delegate),
            "ESCALATE" => Some(Self::Escalate),
            _ => None,
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Delegate | Self::Escalate)
    }
}

impl fmt::Display for ApprovalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ActorId>,
}

impl EventPayload {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self { reason: Some(reason.into()), target: None }
    }

    pub fn target(target: impl Into<String>) -> Self {
        Self { reason: None, target: Some(ActorId::new(target)) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub event: ApprovalEvent,
    pub actor: Actor,
    pub payload: EventPayload,
    pub from: ApprovalState,
    pub to: ApprovalState,
    pub occurred_at: DateTime<Utc>,
}

/// The derived part of a record: everything that replaying the audit log
/// must reproduce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub state: ApprovalState,
    pub resume_stage: Option<ApprovalState>,
    pub delegated_to: Option<ActorId>,
    pub escalated_to: Option<ActorId>,
}

impl Projection {
    pub fn initial() -> Self {
        Self {
            state: ApprovalState::Pending,
            resume_stage: None,
            delegated_to: None,
            escalated_to: None,
        }
    }

    /// Applies `event` through the transition table, or `None` when the
    /// table has no entry for it from this position.
    pub fn step(&self, event: ApprovalEvent, payload: &EventPayload) -> Option<Self> {
        let transition = effective_transition(self.state, self.resume_stage, event)?;
        Some(self.advance(transition.to, payload))
    }

    pub(crate) fn advance(&self, to: ApprovalState, payload: &EventPayload) -> Self {
        let resume_stage = Some(self.resume_stage.unwrap_or(self.state));
        match to {
            ApprovalState::Delegated => Self {
                state: to,
                resume_stage,
                delegated_to: payload.target.clone(),
                escalated_to: self.escalated_to.clone(),
            },
            ApprovalState::Escalated => Self {
                state: to,
                resume_stage,
                delegated_to: self.delegated_to.clone(),
                escalated_to: payload.target.clone(),
            },
            _ => Self { state: to, resume_stage: None, delegated_to: None, escalated_to: None },
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("audit entry {position} has sequence {sequence}")]
    SequenceGap { position: usize, sequence: u64 },
    #[error("audit entry {sequence} starts from {recorded} but replay is at {replayed}")]
    SourceMismatch { sequence: u64, recorded: ApprovalState, replayed: ApprovalState },
    #[error("audit entry {sequence} applies {event} which is not permitted from {state}")]
    IllegalEntry { sequence: u64, state: ApprovalState, event: ApprovalEvent },
    #[error("audit entry {sequence} records target {recorded} but the table yields {replayed}")]
    TargetMismatch { sequence: u64, recorded: ApprovalState, replayed: ApprovalState },
    #[error("record version {version} does not match audit log length {log_len}")]
    VersionMismatch { version: u64, log_len: usize },
    #[error("cached projection {cached:?} differs from replayed projection {replayed:?}")]
    ProjectionMismatch { cached: Box<Projection>, replayed: Box<Projection> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub subject_id: SubjectId,
    pub state: ApprovalState,
    pub resume_stage: Option<ApprovalState>,
    pub delegated_to: Option<ActorId>,
    pub escalated_to: Option<ActorId>,
    pub audit_log: Vec<AuditEntry>,
    /// Compare-and-swap token. Zero until the first transition is stored.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn pending(subject_id: SubjectId) -> Self {
        let now = Utc::now();
        Self {
            subject_id,
            state: ApprovalState::Pending,
            resume_stage: None,
            delegated_to: None,
            escalated_to: None,
            audit_log: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn projection(&self) -> Projection {
        Projection {
            state: self.state,
            resume_stage: self.resume_stage,
            delegated_to: self.delegated_to.clone(),
            escalated_to: self.escalated_to.clone(),
        }
    }

    /// The actor currently holding a delegated or escalated subject.
    pub fn redirect_target(&self) -> Option<&ActorId> {
        match self.state {
            ApprovalState::Delegated => self.delegated_to.as_ref(),
            ApprovalState::Escalated => self.escalated_to.as_ref(),
            _ => None,
        }
    }

    /// Returns the successor record after moving to `to`. The caller is
    /// responsible for having validated the transition.
    pub fn advance(
        &self,
        event: ApprovalEvent,
        to: ApprovalState,
        actor: &Actor,
        payload: &EventPayload,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let projection = self.projection().advance(to, payload);
        let mut audit_log = self.audit_log.clone();
        audit_log.push(AuditEntry {
            sequence: self.version + 1,
            event,
            actor: actor.clone(),
            payload: payload.clone(),
            from: self.state,
            to,
            occurred_at,
        });

        Self {
            subject_id: self.subject_id.clone(),
            state: projection.state,
            resume_stage: projection.resume_stage,
            delegated_to: projection.delegated_to,
            escalated_to: projection.escalated_to,
            audit_log,
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: occurred_at,
        }
    }

    /// Rebuilds the projection by replaying the audit log from `PENDING`.
    pub fn replay(&self) -> Result<Projection, ReplayError> {
        let mut position = Projection::initial();

        for (index, entry) in self.audit_log.iter().enumerate() {
            let expected_sequence = index as u64 + 1;
            if entry.sequence != expected_sequence {
                return Err(ReplayError::SequenceGap { position: index, sequence: entry.sequence });
            }
            if entry.from != position.state {
                return Err(ReplayError::SourceMismatch {
                    sequence: entry.sequence,
                    recorded: entry.from,
                    replayed: position.state,
                });
            }

            let next = position.step(entry.event, &entry.payload).ok_or(
                ReplayError::IllegalEntry {
                    sequence: entry.sequence,
                    state: position.state,
                    event: entry.event,
                },
            )?;
            if next.state != entry.to {
                return Err(ReplayError::TargetMismatch {
                    sequence: entry.sequence,
                    recorded: entry.to,
                    replayed: next.state,
                });
            }
            position = next;
        }

        Ok(position)
    }

    pub fn verify_projection(&self) -> Result<(), ReplayError> {
        if self.version != self.audit_log.len() as u64 {
            return Err(ReplayError::VersionMismatch {
                version: self.version,
                log_len: self.audit_log.len(),
            });
        }

        let replayed = self.replay()?;
        let cached = self.projection();
        if replayed != cached {
            return Err(ReplayError::ProjectionMismatch {
                cached: Box::new(cached),
                replayed: Box::new(replayed),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        Actor, ActorId, ActorRole, ApprovalEvent, ApprovalRecord, ApprovalState, EventPayload,
        ReplayError, SubjectId,
    };

    fn manager() -> Actor {
        Actor::new("mgr-1", ActorRole::Manager)
    }

    #[test]
    fn role_parsing_is_case_insensitive_and_keeps_other_reviewers() {
        assert_eq!(ActorRole::parse("manager"), Some(ActorRole::Manager));
        assert_eq!(ActorRole::parse(" Hr "), Some(ActorRole::Hr));
        assert_eq!(ActorRole::parse("FINANCE"), Some(ActorRole::Finance));
        assert_eq!(ActorRole::parse("auditor"), Some(ActorRole::Reviewer("auditor".to_string())));
        assert_eq!(ActorRole::parse("   "), None);
        assert!(!ActorRole::Reviewer("auditor".to_string()).is_assigned_reviewer());
    }

    #[test]
    fn storage_keys_keep_reviewers_apart_from_stage_roles() {
        let lookalike = ActorRole::Reviewer("manager".to_string());
        assert_eq!(lookalike.storage_key(), "REVIEWER:manager");
        assert_eq!(ActorRole::from_storage_key(&lookalike.storage_key()), Some(lookalike));

        for stage in [ActorRole::Manager, ActorRole::Hr, ActorRole::Finance] {
            assert_eq!(ActorRole::from_storage_key(&stage.storage_key()), Some(stage));
        }
        assert_eq!(ActorRole::from_storage_key("manager"), None);
        assert_eq!(ActorRole::from_storage_key("REVIEWER:"), None);
    }

    #[test]
    fn state_and_event_names_round_trip_through_parse() {
        for state in ApprovalState::ALL {
            assert_eq!(ApprovalState::parse(state.as_str()), Some(state));
        }
        for event in ApprovalEvent::ALL {
            assert_eq!(ApprovalEvent::parse(event.as_str()), Some(event));
        }
        assert_eq!(ApprovalState::parse("SUBMITTED"), None);
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&ApprovalState::ManagerApproved).expect("serialize");
        assert_eq!(json, "\"MANAGER_APPROVED\"");
        let event: ApprovalEvent = serde_json::from_str("\"FINANCE_APPROVE\"").expect("parse");
        assert_eq!(event, ApprovalEvent::FinanceApprove);
    }

    #[test]
    fn fresh_record_is_pending_and_unpersisted() {
        let record = ApprovalRecord::pending(SubjectId::new("TE-1"));
        assert_eq!(record.state, ApprovalState::Pending);
        assert!(!record.is_persisted());
        assert!(record.audit_log.is_empty());
        assert_eq!(record.verify_projection(), Ok(()));
    }

    #[test]
    fn advance_appends_audit_entry_and_bumps_version() {
        let record = ApprovalRecord::pending(SubjectId::new("TE-1"));
        let next = record.advance(
            ApprovalEvent::ManagerApprove,
            ApprovalState::ManagerApproved,
            &manager(),
            &EventPayload::default(),
            Utc::now(),
        );

        assert_eq!(next.version, 1);
        assert_eq!(next.state, ApprovalState::ManagerApproved);
        assert_eq!(next.audit_log.len(), 1);
        assert_eq!(next.audit_log[0].from, ApprovalState::Pending);
        assert_eq!(next.audit_log[0].sequence, 1);
        assert_eq!(next.verify_projection(), Ok(()));
    }

    #[test]
    fn delegation_parks_stage_and_resume_clears_pointers() {
        let record = ApprovalRecord::pending(SubjectId::new("TE-2"));
        let delegated = record.advance(
            ApprovalEvent::Delegate,
            ApprovalState::Delegated,
            &manager(),
            &EventPayload::target("mgr-2"),
            Utc::now(),
        );
        assert_eq!(delegated.resume_stage, Some(ApprovalState::Pending));
        assert_eq!(delegated.redirect_target(), Some(&ActorId::new("mgr-2")));

        let resumed = delegated.advance(
            ApprovalEvent::ManagerApprove,
            ApprovalState::ManagerApproved,
            &Actor::new("mgr-2", ActorRole::Manager),
            &EventPayload::default(),
            Utc::now(),
        );
        assert_eq!(resumed.resume_stage, None);
        assert_eq!(resumed.delegated_to, None);
        assert_eq!(resumed.verify_projection(), Ok(()));
    }

    #[test]
    fn tampered_state_is_detected_by_replay() {
        let record = ApprovalRecord::pending(SubjectId::new("TE-3"));
        let mut next = record.advance(
            ApprovalEvent::ManagerApprove,
            ApprovalState::ManagerApproved,
            &manager(),
            &EventPayload::default(),
            Utc::now(),
        );
        next.state = ApprovalState::FinanceApproved;

        assert!(matches!(next.verify_projection(), Err(ReplayError::ProjectionMismatch { .. })));
    }

    #[test]
    fn illegal_log_entry_is_detected_by_replay() {
        let record = ApprovalRecord::pending(SubjectId::new("TE-4"));
        let mut next = record.advance(
            ApprovalEvent::FinanceApprove,
            ApprovalState::FinanceApproved,
            &Actor::new("fin-1", ActorRole::Finance),
            &EventPayload::default(),
            Utc::now(),
        );
        next.state = ApprovalState::FinanceApproved;

        assert_eq!(
            next.replay(),
            Err(ReplayError::IllegalEntry {
                sequence: 1,
                state: ApprovalState::Pending,
                event: ApprovalEvent::FinanceApprove,
            })
        );
    }

    #[test]
    fn version_must_match_log_length() {
        let mut record = ApprovalRecord::pending(SubjectId::new("TE-5"));
        record.version = 3;
        assert_eq!(
            record.verify_projection(),
            Err(ReplayError::VersionMismatch { version: 3, log_len: 0 })
        );
    }
}
