use serde_json::json;
use tempo_core::config::LoadOptions;
use tempo_core::domain::approval::{Actor, ActorId, ApprovalRecord, SubjectId};
use tempo_core::errors::{ApplicationError, WorkflowError};
use uuid::Uuid;

use crate::commands::{with_service, CommandResult};

pub fn approve(options: &LoadOptions, subject: &str, actor: &Actor) -> CommandResult {
    let subject_id = SubjectId::new(subject);
    with_service("approve", options, |service| async move {
        report("approve", service.approve(&subject_id, actor).await)
    })
}

pub fn reject(options: &LoadOptions, subject: &str, actor: &Actor, reason: &str) -> CommandResult {
    let subject_id = SubjectId::new(subject);
    with_service("reject", options, |service| async move {
        report("reject", service.reject(&subject_id, actor, reason).await)
    })
}

pub fn delegate(options: &LoadOptions, subject: &str, actor: &Actor, target: &str) -> CommandResult {
    let subject_id = SubjectId::new(subject);
    let target = ActorId::new(target);
    with_service("delegate", options, |service| async move {
        report("delegate", service.delegate(&subject_id, actor, &target).await)
    })
}

pub fn escalate(options: &LoadOptions, subject: &str, actor: &Actor, target: &str) -> CommandResult {
    let subject_id = SubjectId::new(subject);
    let target = ActorId::new(target);
    with_service("escalate", options, |service| async move {
        report("escalate", service.escalate(&subject_id, actor, &target).await)
    })
}

pub fn approve_bulk(options: &LoadOptions, subjects: &[String], actor: &Actor) -> CommandResult {
    let subject_ids: Vec<SubjectId> = subjects.iter().map(SubjectId::new).collect();
    with_service("approve-bulk", options, |service| async move {
        match service.approve_bulk(&subject_ids, actor).await {
            Ok(batch) => {
                let states: Vec<_> = batch
                    .records
                    .iter()
                    .map(|record| {
                        json!({
                            "subject_id": record.subject_id,
                            "state": record.state,
                            "version": record.version,
                        })
                    })
                    .collect();
                CommandResult::success_with_data(
                    "approve-bulk",
                    format!("applied {} to {} entries", batch.event, batch.len()),
                    Some(json!({ "event": batch.event, "records": states })),
                )
            }
            Err(error) => CommandResult::from_application_error(
                "approve-bulk",
                ApplicationError::from(error),
                &Uuid::new_v4().to_string(),
            ),
        }
    })
}

fn report(command: &str, result: Result<ApprovalRecord, WorkflowError>) -> CommandResult {
    match result {
        Ok(record) => CommandResult::success_with_data(
            command,
            format!("{} is now {}", record.subject_id, record.state),
            serde_json::to_value(&record).ok(),
        ),
        Err(error) => CommandResult::from_application_error(
            command,
            ApplicationError::from(error),
            &Uuid::new_v4().to_string(),
        ),
    }
}
