//! Daemon configuration: defaults merged with an optional file, published as
//! an immutable snapshot in a process-wide atomic cell. Readers load the
//! snapshot once per operation; reloads build a whole new snapshot and swap
//! it in; a published snapshot is never mutated.

use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

static ACTIVE: ArcSwapOption<Settings> = ArcSwapOption::const_empty();

/// Explicit config file path from the command line, if any. Fixed once at
/// startup, like the search paths themselves.
static CONFIG_FILE: OnceLock<Option<String>> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub policy: Policy,
    pub reflection: Reflection,
    pub authorizer: Authorizer,
    pub metrics: Metrics,
    pub reload: Reload,
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Ordered directories scanned for `.kdl` policy files.
    pub directories: Vec<String>,
    pub watch_directories: bool,
    /// When set, a condition or storage expression error fails the request
    /// instead of falling through to the next rule.
    pub strict_mode: bool,
    /// Where policy `print` output goes: `stdout`, `stderr` or `none`.
    pub print_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorizer {
    pub includes_metrics: bool,
    pub listener: Listener,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub enabled: bool,
    pub path: String,
    pub listener: Listener,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    /// `unix` or `tcp`.
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reload {
    pub configuration: bool,
    pub policies: bool,
    pub reopen_log_file: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    /// `stderr`, `stdout`, or a file path.
    pub filename: String,
    pub level: String,
    /// Input fields attached to each decision log: `"*"`, a list of field
    /// names, or false/empty for none.
    pub input: LogFields,
    /// Same, for the decision record.
    pub detailed_result: LogFields,
}

/// Field selection for decision logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogFields {
    Flag(bool),
    Pattern(String),
    List(Vec<String>),
}

impl LogFields {
    /// Project the selected fields out of a JSON object. `None` means the
    /// attachment is disabled entirely.
    pub fn project(&self, value: &Value) -> Option<Value> {
        match self {
            LogFields::Flag(false) => None,
            LogFields::Flag(true) => Some(value.clone()),
            LogFields::Pattern(p) if p.is_empty() => None,
            LogFields::Pattern(p) if p == "*" => Some(value.clone()),
            LogFields::Pattern(field) => Some(project_fields(value, std::slice::from_ref(field))),
            LogFields::List(fields) if fields.is_empty() => None,
            LogFields::List(fields) => Some(project_fields(value, fields)),
        }
    }
}

fn project_fields(value: &Value, fields: &[impl AsRef<str>]) -> Value {
    let mut projected = serde_json::Map::new();
    if let Value::Object(map) = value {
        for field in fields {
            if let Some(v) = map.get(field.as_ref()) {
                projected.insert(field.as_ref().to_string(), v.clone());
            }
        }
    }
    Value::Object(projected)
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            directories: vec!["./policies/".to_string()],
            watch_directories: true,
            strict_mode: true,
            print_to: "stdout".to_string(),
        }
    }
}

impl Default for Reflection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for Authorizer {
    fn default() -> Self {
        Self {
            includes_metrics: false,
            listener: Listener {
                kind: "unix".to_string(),
                address: "./serve.sock".to_string(),
            },
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
            listener: Listener {
                kind: "tcp".to_string(),
                address: "127.0.0.1:9100".to_string(),
            },
        }
    }
}

impl Default for Reload {
    fn default() -> Self {
        Self {
            configuration: true,
            policies: true,
            reopen_log_file: true,
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            filename: "stderr".to_string(),
            level: "info".to_string(),
            input: LogFields::Pattern("*".to_string()),
            detailed_result: LogFields::Pattern("*".to_string()),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            reflection: Reflection::default(),
            authorizer: Authorizer::default(),
            metrics: Metrics::default(),
            reload: Reload::default(),
            log: Log::default(),
        }
    }
}

/// Fix the optional explicit config file path. Called once at startup,
/// before the first [`load`].
pub fn initialize(config_file: Option<String>) {
    let _ = CONFIG_FILE.set(config_file);
}

/// Load defaults plus the config file and publish the new snapshot. On
/// error nothing is published and the previous snapshot (if any) stays
/// active.
pub fn load() -> Result<Arc<Settings>> {
    let defaults = Settings::default();
    let mut builder = config::Config::builder()
        .set_default("policy.directories", defaults.policy.directories.clone())
        .into_diagnostic()?
        .set_default("policy.watch_directories", defaults.policy.watch_directories)
        .into_diagnostic()?
        .set_default("policy.strict_mode", defaults.policy.strict_mode)
        .into_diagnostic()?
        .set_default("policy.print_to", defaults.policy.print_to.clone())
        .into_diagnostic()?
        .set_default("reflection.enabled", defaults.reflection.enabled)
        .into_diagnostic()?
        .set_default(
            "authorizer.includes_metrics",
            defaults.authorizer.includes_metrics,
        )
        .into_diagnostic()?
        .set_default(
            "authorizer.listener.type",
            defaults.authorizer.listener.kind.clone(),
        )
        .into_diagnostic()?
        .set_default(
            "authorizer.listener.address",
            defaults.authorizer.listener.address.clone(),
        )
        .into_diagnostic()?
        .set_default("metrics.enabled", defaults.metrics.enabled)
        .into_diagnostic()?
        .set_default("metrics.path", defaults.metrics.path.clone())
        .into_diagnostic()?
        .set_default(
            "metrics.listener.type",
            defaults.metrics.listener.kind.clone(),
        )
        .into_diagnostic()?
        .set_default(
            "metrics.listener.address",
            defaults.metrics.listener.address.clone(),
        )
        .into_diagnostic()?
        .set_default("reload.configuration", defaults.reload.configuration)
        .into_diagnostic()?
        .set_default("reload.policies", defaults.reload.policies)
        .into_diagnostic()?
        .set_default("reload.reopen_log_file", defaults.reload.reopen_log_file)
        .into_diagnostic()?
        .set_default("log.filename", defaults.log.filename.clone())
        .into_diagnostic()?
        .set_default("log.level", defaults.log.level.clone())
        .into_diagnostic()?
        .set_default("log.input", "*")
        .into_diagnostic()?
        .set_default("log.detailed_result", "*")
        .into_diagnostic()?;

    builder = match CONFIG_FILE.get().and_then(|o| o.as_deref()) {
        Some(path) => builder.add_source(config::File::with_name(path)),
        None => builder
            .add_source(
                config::File::with_name("/etc/docker-socket-authorizer/config").required(false),
            )
            .add_source(config::File::with_name("config").required(false)),
    };

    let settings: Settings = builder
        .build()
        .into_diagnostic()?
        .try_deserialize()
        .into_diagnostic()?;

    let settings = Arc::new(settings);
    ACTIVE.store(Some(settings.clone()));
    Ok(settings)
}

/// Publish the built-in defaults (startup fallback when the file is
/// unreadable). Never overwrites an already-published snapshot.
pub fn fall_back_to_defaults() -> Arc<Settings> {
    let defaults = Arc::new(Settings::default());
    let current = ACTIVE.load();
    match current.as_ref() {
        Some(settings) => settings.clone(),
        None => {
            ACTIVE.store(Some(defaults.clone()));
            defaults
        }
    }
}

/// Tests that flip the process-wide cell take turns on this lock.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn publish_for_tests(settings: Settings) {
    ACTIVE.store(Some(Arc::new(settings)));
}

/// The active snapshot. Callers hold the returned `Arc` for the duration of
/// one operation; concurrent reloads cannot tear it.
pub fn active() -> Arc<Settings> {
    ACTIVE
        .load()
        .as_ref()
        .cloned()
        .unwrap_or_else(|| Arc::new(Settings::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.policy.directories, vec!["./policies/"]);
        assert!(s.policy.watch_directories);
        assert!(s.policy.strict_mode);
        assert_eq!(s.authorizer.listener.kind, "unix");
        assert_eq!(s.metrics.listener.kind, "tcp");
        assert_eq!(s.metrics.path, "/metrics");
        assert_eq!(s.log.filename, "stderr");
    }

    #[test]
    fn test_log_fields_star_projects_everything() {
        let fields = LogFields::Pattern("*".to_string());
        let value = json!({"a": 1, "b": 2});
        assert_eq!(fields.project(&value), Some(value));
    }

    #[test]
    fn test_log_fields_list_projects_subset() {
        let fields = LogFields::List(vec!["method".to_string(), "uri".to_string()]);
        let value = json!({"method": "GET", "uri": "/x", "body": "secret"});
        assert_eq!(
            fields.project(&value),
            Some(json!({"method": "GET", "uri": "/x"}))
        );
    }

    #[test]
    fn test_log_fields_disabled_variants() {
        let value = json!({"a": 1});
        assert_eq!(LogFields::Flag(false).project(&value), None);
        assert_eq!(LogFields::Pattern(String::new()).project(&value), None);
        assert_eq!(LogFields::List(Vec::new()).project(&value), None);
    }
}
