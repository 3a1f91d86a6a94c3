use std::{collections::HashMap, fs, path::Path};

use anyhow::Context;
use designer_core::DEFAULT_DRIFT_TOLERANCE;

pub const SETTINGS_FILE: &str = "formctl.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    pub form_id: String,
    pub drift_tolerance: usize,
    pub queue_capacity: usize,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/forms.db".into(),
            form_id: "default-form".into(),
            drift_tolerance: DEFAULT_DRIFT_TOLERANCE,
            queue_capacity: 32,
            log_filter: "info".into(),
        }
    }
}

/// Defaults, then `formctl.toml` in the working directory, then environment.
///
/// A missing file is fine; a file that does not parse is an error.
pub fn load_settings() -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    apply_file(&mut settings, Path::new(SETTINGS_FILE))?;
    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, path: &Path) -> anyhow::Result<()> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Ok(());
    };
    let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(&raw)
        .with_context(|| format!("invalid settings in '{}'", path.display()))?;

    if let Some(v) = file_cfg.get("database_url").and_then(toml::Value::as_str) {
        settings.database_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("form_id").and_then(toml::Value::as_str) {
        settings.form_id = v.to_string();
    }
    if let Some(v) = file_cfg.get("log_filter").and_then(toml::Value::as_str) {
        settings.log_filter = v.to_string();
    }
    if let Some(v) = file_cfg.get("drift_tolerance").and_then(non_negative) {
        settings.drift_tolerance = v;
    }
    if let Some(v) = file_cfg.get("queue_capacity").and_then(non_negative) {
        settings.queue_capacity = v;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("FORMCTL_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("FORMCTL_FORM_ID") {
        settings.form_id = v;
    }
    if let Some(v) = var("APP__FORM_ID") {
        settings.form_id = v;
    }

    if let Some(v) = var("APP__DRIFT_TOLERANCE") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.drift_tolerance = parsed;
        }
    }
    if let Some(v) = var("APP__QUEUE_CAPACITY") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.queue_capacity = parsed;
        }
    }

    if let Some(v) = var("RUST_LOG") {
        settings.log_filter = v;
    }
    if let Some(v) = var("APP__LOG_FILTER") {
        settings.log_filter = v;
    }
}

fn non_negative(value: &toml::Value) -> Option<usize> {
    value
        .as_integer()
        .and_then(|raw| usize::try_from(raw).ok())
}

/// Turns bare paths and `sqlite:path` into `sqlite://` urls.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
