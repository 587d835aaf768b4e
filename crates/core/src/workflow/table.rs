use crate::domain::approval::{ActorRole, ApprovalEvent, ApprovalState};
use ApprovalEvent::{Delegate, Escalate, FinanceApprove, HrApprove, ManagerApprove, Reject};
use ApprovalState::{
    Delegated, Escalated, FinanceApproved, HrApproved, ManagerApproved, Pending, Rejected,
};

/// Who may trigger a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequiredRoles {
    Manager,
    Hr,
    Finance,
    /// Any of the three stage reviewers.
    AnyAssignedReviewer,
    /// The reviewer owning the stage the subject currently sits in.
    CurrentReviewer,
}

impl RequiredRoles {
    pub fn permits(self, from: ApprovalState, role: &ActorRole) -> bool {
        match self {
            Self::Manager => *role == ActorRole::Manager,
            Self::Hr => *role == ActorRole::Hr,
            Self::Finance => *role == ActorRole::Finance,
            Self::AnyAssignedReviewer => role.is_assigned_reviewer(),
            Self::CurrentReviewer => stage_reviewer(from).as_ref() == Some(role),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ApprovalState,
    pub event: ApprovalEvent,
    pub to: ApprovalState,
    pub required: RequiredRoles,
}

const fn entry(
    from: ApprovalState,
    event: ApprovalEvent,
    to: ApprovalState,
    required: RequiredRoles,
) -> Transition {
    Transition { from, event, to, required }
}

pub const TRANSITIONS: &[Transition] = &[
    entry(Pending, ManagerApprove, ManagerApproved, RequiredRoles::Manager),
    entry(ManagerApproved, HrApprove, HrApproved, RequiredRoles::Hr),
    entry(HrApproved, FinanceApprove, FinanceApproved, RequiredRoles::Finance),
    entry(Pending, Reject, Rejected, RequiredRoles::AnyAssignedReviewer),
    entry(ManagerApproved, Reject, Rejected, RequiredRoles::AnyAssignedReviewer),
    entry(HrApproved, Reject, Rejected, RequiredRoles::AnyAssignedReviewer),
    entry(Pending, Delegate, Delegated, RequiredRoles::CurrentReviewer),
    entry(ManagerApproved, Delegate, Delegated, RequiredRoles::CurrentReviewer),
    entry(HrApproved, Delegate, Delegated, RequiredRoles::CurrentReviewer),
    entry(Pending, Escalate, Escalated, RequiredRoles::CurrentReviewer),
    entry(ManagerApproved, Escalate, Escalated, RequiredRoles::CurrentReviewer),
    entry(HrApproved, Escalate, Escalated, RequiredRoles::CurrentReviewer),
];

/// Total over the (state, event) domain: pairs missing from the table
/// yield `None`.
pub fn allowed_transition(state: ApprovalState, event: ApprovalEvent) -> Option<Transition> {
    TRANSITIONS.iter().copied().find(|transition| transition.from == state && transition.event == event)
}

/// Like [`allowed_transition`], but a delegated or escalated subject is
/// looked up at the stage it was parked from.
pub fn effective_transition(
    state: ApprovalState,
    resume_stage: Option<ApprovalState>,
    event: ApprovalEvent,
) -> Option<Transition> {
    if state.is_redirect() {
        let stage = resume_stage.filter(|stage| !stage.is_redirect())?;
        return allowed_transition(stage, event);
    }
    allowed_transition(state, event)
}

pub fn stage_reviewer(state: ApprovalState) -> Option<ActorRole> {
    match state {
        Pending => Some(ActorRole::Manager),
        ManagerApproved => Some(ActorRole::Hr),
        HrApproved => Some(ActorRole::Finance),
        FinanceApproved | Rejected | Delegated | Escalated => None,
    }
}
