use tempo_core::config::LoadOptions;
use tempo_core::domain::approval::SubjectId;
use tempo_core::errors::ApplicationError;
use uuid::Uuid;

use crate::commands::{with_service, CommandResult};

pub fn run(options: &LoadOptions, subject: &str) -> CommandResult {
    let subject_id = SubjectId::new(subject);
    with_service("show", options, |service| async move {
        match service.record(&subject_id).await {
            Ok(record) => {
                let message = if record.is_persisted() {
                    format!(
                        "{} is {} after {} transition(s)",
                        record.subject_id,
                        record.state,
                        record.audit_log.len()
                    )
                } else {
                    format!("{} has no recorded transitions and is PENDING", record.subject_id)
                };
                CommandResult::success_with_data("show", message, serde_json::to_value(&record).ok())
            }
            Err(error) => CommandResult::from_application_error(
                "show",
                ApplicationError::from(error),
                &Uuid::new_v4().to_string(),
            ),
        }
    })
}
