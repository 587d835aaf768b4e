pub mod config;
pub mod decide;
pub mod doctor;
pub mod migrate;
pub mod show;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tempo_core::audit::TracingAuditSink;
use tempo_core::config::{AppConfig, LoadOptions};
use tempo_core::errors::{ApplicationError, InterfaceError};
use tempo_core::workflow::{ApprovalService, TracingObserver, WorkflowEngine};
use tempo_db::{connect, migrations, SqlApprovalRecordStore};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_data(command, message, None)
    }

    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::failure_with_data(command, error_class, message, exit_code, None)
    }

    pub fn failure_with_data(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
        data: Option<Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    /// Maps a workflow or batch failure onto the interface contract.
    pub fn from_application_error(
        command: &str,
        error: ApplicationError,
        correlation_id: &str,
    ) -> Self {
        let error_class = error.error_class();
        let detail = error.to_string();
        let exit_code = exit_code_for(error_class);
        let interface = error.into_interface(correlation_id);

        let mut data = serde_json::json!({
            "detail": detail,
            "correlation_id": interface.correlation_id(),
        });
        if let InterfaceError::PartiallyApplied { committed, failed, .. } = &interface {
            data["committed"] = serde_json::json!(committed);
            data["failed"] = serde_json::json!(failed);
        }

        Self::failure_with_data(command, error_class, interface.user_message(), exit_code, Some(data))
    }

    /// Setup failures before any workflow runs. The detailed message is kept
    /// since the reader is the operator.
    pub fn from_setup_error(command: &str, error: ApplicationError) -> Self {
        let error_class = error.error_class();
        Self::failure(command, error_class, error.to_string(), exit_code_for(error_class))
    }
}

/// Exit codes 2..=5 belong to setup failures; workflow outcomes start at 10.
pub fn exit_code_for(error_class: &str) -> u8 {
    match error_class {
        "config_validation" => 2,
        "runtime_init" => 3,
        "db_connectivity" => 4,
        "migration" => 5,
        "illegal_transition" | "invalid_payload" | "batch_validation_failed" => 10,
        "unauthorized" => 11,
        "store_timeout" | "store_unavailable" | "contended" => 12,
        "partial_apply_failure" | "cancelled" => 13,
        _ => 14,
    }
}

pub(crate) type SqlService = ApprovalService<SqlApprovalRecordStore>;

/// Loads config, opens the migrated store and runs `action` against an
/// approval service. Setup failures use the same codes as `migrate`.
pub(crate) fn with_service<F, Fut>(command: &str, options: &LoadOptions, action: F) -> CommandResult
where
    F: FnOnce(Arc<SqlService>) -> Fut,
    Fut: Future<Output = CommandResult>,
{
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => {
            let error = ApplicationError::Configuration(error.to_string());
            return CommandResult::from_setup_error(command, error);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    runtime.block_on(async {
        let pool = match connect(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                let error = ApplicationError::Persistence(error.to_string());
                return CommandResult::from_setup_error(command, error);
            }
        };
        if let Err(error) = migrations::run_pending(&pool).await {
            pool.close().await;
            let error = ApplicationError::Migration(error.to_string());
            return CommandResult::from_setup_error(command, error);
        }

        let engine = WorkflowEngine::with_config(
            Arc::new(SqlApprovalRecordStore::new(pool.clone())),
            config.workflow.clone(),
        )
        .with_audit_sink(Arc::new(TracingAuditSink))
        .with_observer(Arc::new(TracingObserver));

        let result = action(Arc::new(ApprovalService::new(engine))).await;
        pool.close().await;
        result
    })
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
