use std::env;
use std::fs;
use std::path::Path;

use tempo_core::config::{resolve_config_path, AppConfig, LoadOptions};
use toml::Value;

pub fn run(options: &LoadOptions) -> String {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let fields: [(&str, String, &[&str]); 9] = [
        ("database.url", config.database.url.clone(), &["TEMPO_DATABASE_URL"]),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["TEMPO_DATABASE_MAX_CONNECTIONS"],
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["TEMPO_DATABASE_TIMEOUT_SECS"],
        ),
        (
            "workflow.max_attempts",
            config.workflow.max_attempts.to_string(),
            &["TEMPO_WORKFLOW_MAX_ATTEMPTS"],
        ),
        (
            "workflow.retry_base_delay_ms",
            config.workflow.retry_base_delay_ms.to_string(),
            &["TEMPO_WORKFLOW_RETRY_BASE_DELAY_MS"],
        ),
        (
            "workflow.retry_backoff_multiplier",
            config.workflow.retry_backoff_multiplier.to_string(),
            &["TEMPO_WORKFLOW_RETRY_BACKOFF_MULTIPLIER"],
        ),
        (
            "workflow.store_timeout_ms",
            config.workflow.store_timeout_ms.to_string(),
            &["TEMPO_WORKFLOW_STORE_TIMEOUT_MS"],
        ),
        ("logging.level", config.logging.level.clone(), &["TEMPO_LOGGING_LEVEL", "TEMPO_LOG_LEVEL"]),
        (
            "logging.format",
            format!("{:?}", config.logging.format),
            &["TEMPO_LOGGING_FORMAT", "TEMPO_LOG_FORMAT"],
        ),
    ];

    let mut lines =
        vec!["effective config (source precedence: flag > env > file > default):".to_string()];
    for (key_path, value, env_keys) in fields {
        let source = if key_path == "database.url" && options.overrides.database_url.is_some() {
            "flag (--database-url)".to_string()
        } else {
            field_source(
                key_path,
                env_keys,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            )
        };
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
