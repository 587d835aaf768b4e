use crate::commands::CommandResult;
use tempo_core::config::{AppConfig, LoadOptions};
use tempo_core::errors::ApplicationError;
use tempo_db::{connect, migrations};

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => {
            let error = ApplicationError::Configuration(error.to_string());
            return CommandResult::from_setup_error("migrate", error);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ApplicationError::Migration(error.to_string()))?;
        tracing::info!(
            event_name = "system.migrate.completed",
            database_url = %config.database.url,
            "approval store migrations applied"
        );
        pool.close().await;
        Ok::<(), ApplicationError>(())
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(error) => CommandResult::from_setup_error("migrate", error),
    }
}
