//! Runloom configuration system.
//!
//! Loaded from TOML (`~/.runloom/config.toml` by default), then the active
//! profile from `~/.runloom/profiles.toml` (`RUNLOOM_PROFILE`), then
//! `RUNLOOM_*` environment variables.
//!
//! A profiles file holds named tables of `RUNLOOM_*` settings:
//!
//! ```toml
//! [default]
//!
//! [ci]
//! RUNLOOM_TEST_MODE = 1
//! RUNLOOM_LOGGING_LEVEL = "debug"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, RunloomError};

/// Settings understood by [`RunloomConfig::apply_env_overrides`], without
/// the `RUNLOOM_` prefix.
pub const SETTINGS: &[&str] = &[
    "TEST_MODE",
    "LOGGING_LEVEL",
    "LOGGING_EXTRA_LOGGERS",
    "API_DEFAULT_LIMIT",
    "SCHEDULER_LOOP_INTERVAL_SECS",
    "SCHEDULER_MAX_SCHEDULED_RUNS",
    "SCHEDULER_MAX_SCHEDULE_HORIZON_DAYS",
    "SCHEDULER_LATE_RUNS_AFTER_SECS",
    "STORE_SNAPSHOT_PATH",
];

pub const DEFAULT_PROFILE: &str = "default";

/// Raw profile tables by name, as read from a profiles file.
pub type Profiles = BTreeMap<String, toml::Table>;

/// One profile's settings, values rendered as strings.
pub type Profile = BTreeMap<String, String>;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunloomConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub test_mode: bool,
}

impl RunloomConfig {
    /// Load config from the default path, falling back to defaults, then
    /// apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        if let Ok(name) = std::env::var("RUNLOOM_PROFILE") {
            config.apply_profile(&Self::profiles_path(), &name)?;
        }
        config.apply_env_overrides(std::env::vars())?;
        Ok(config)
    }

    /// Apply profile `name` from the profiles file at `path`.
    pub fn apply_profile(&mut self, path: &Path, name: &str) -> Result<()> {
        let profile = load_profile(path, name)?;
        tracing::debug!("Applying profile '{name}' ({} settings)", profile.len());
        self.apply_env_overrides(profile)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RunloomError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| RunloomError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to a path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RunloomError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `RUNLOOM_*` overrides. Unknown keys are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("RUNLOOM_") else {
                continue;
            };
            match name {
                "TEST_MODE" => self.test_mode = parse_bool(&key, &value)?,
                "LOGGING_LEVEL" => self.logging.level = value,
                "LOGGING_EXTRA_LOGGERS" => self.logging.extra_loggers = parse_list(&value),
                "API_DEFAULT_LIMIT" => self.api.default_limit = parse_num(&key, &value)?,
                "SCHEDULER_LOOP_INTERVAL_SECS" => {
                    self.scheduler.loop_interval_secs = parse_num(&key, &value)?
                }
                "SCHEDULER_MAX_SCHEDULED_RUNS" => {
                    self.scheduler.max_scheduled_runs = parse_num(&key, &value)?
                }
                "SCHEDULER_MAX_SCHEDULE_HORIZON_DAYS" => {
                    self.scheduler.max_schedule_horizon_days = parse_num(&key, &value)?
                }
                "SCHEDULER_LATE_RUNS_AFTER_SECS" => {
                    self.scheduler.late_runs_after_secs = parse_num(&key, &value)?
                }
                "STORE_SNAPSHOT_PATH" => self.store.snapshot_path = Some(value),
                "PROFILE" => {}
                _ => tracing::debug!("Ignoring unknown setting {key}"),
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the default profiles path.
    pub fn profiles_path() -> PathBuf {
        Self::home_dir().join("profiles.toml")
    }

    /// Get the Runloom home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".runloom")
    }
}

/// Read every profile in `path`. A missing file holds only an empty
/// `default` profile, and `default` is always present.
pub fn load_profiles(path: &Path) -> Result<Profiles> {
    let mut profiles = Profiles::new();
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RunloomError::Config(format!("Failed to read profiles: {e}")))?;
        let table: toml::Table = toml::from_str(&content)
            .map_err(|e| RunloomError::Config(format!("Failed to parse profiles: {e}")))?;
        for (name, value) in table {
            let toml::Value::Table(settings) = value else {
                return Err(RunloomError::Config(format!(
                    "Profile '{name}' must be a table"
                )));
            };
            profiles.insert(name, settings);
        }
    }
    profiles.entry(DEFAULT_PROFILE.to_string()).or_default();
    Ok(profiles)
}

/// Settings of profile `name`. Unknown keys and nested tables are rejected.
pub fn load_profile(path: &Path, name: &str) -> Result<Profile> {
    let mut profiles = load_profiles(path)?;
    let settings = profiles
        .remove(name)
        .ok_or_else(|| RunloomError::Config(format!("Profile '{name}' not found.")))?;

    let mut profile = Profile::new();
    for (key, value) in settings {
        let known = key
            .strip_prefix("RUNLOOM_")
            .is_some_and(|setting| SETTINGS.contains(&setting));
        let rendered = match value {
            toml::Value::String(s) => Some(s),
            toml::Value::Integer(n) => Some(n.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        };
        match rendered.filter(|_| known) {
            Some(rendered) => profile.insert(key, rendered),
            None => {
                return Err(RunloomError::Config(format!(
                    "Unknown setting in profile '{name}': '{key}'"
                )));
            }
        };
    }
    Ok(profile)
}

/// Write `profiles` to `path`, `default` first and always present.
pub fn write_profiles(path: &Path, profiles: &Profiles) -> Result<()> {
    let empty = toml::Table::new();
    let default = profiles.get(DEFAULT_PROFILE).unwrap_or(&empty);
    let others = profiles.iter().filter(|(name, _)| name.as_str() != DEFAULT_PROFILE);

    let mut sections = Vec::new();
    for (name, settings) in std::iter::once((DEFAULT_PROFILE, default))
        .chain(others.map(|(name, settings)| (name.as_str(), settings)))
    {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RunloomError::Config(format!("Invalid profile name '{name}'")));
        }
        let body = toml::to_string(settings)
            .map_err(|e| RunloomError::Config(format!("Failed to serialize profiles: {e}")))?;
        sections.push(format!("[{name}]\n{body}"));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, sections.join("\n"))?;
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(RunloomError::Config(format!("{key}: not a boolean: '{other}'"))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RunloomError::Config(format!("{key}: not a number: '{value}'")))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_loop_interval_secs")]
    pub loop_interval_secs: u64,
    /// Future runs kept per deployment.
    #[serde(default = "default_max_scheduled_runs")]
    pub max_scheduled_runs: usize,
    #[serde(default = "default_max_schedule_horizon_days")]
    pub max_schedule_horizon_days: i64,
    /// Scheduled runs this far past their fire time are marked Late.
    #[serde(default = "default_late_runs_after_secs")]
    pub late_runs_after_secs: i64,
}

fn default_loop_interval_secs() -> u64 { 60 }
fn default_max_scheduled_runs() -> usize { 100 }
fn default_max_schedule_horizon_days() -> i64 { 100 }
fn default_late_runs_after_secs() -> i64 { 5 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            loop_interval_secs: default_loop_interval_secs(),
            max_scheduled_runs: default_max_scheduled_runs(),
            max_schedule_horizon_days: default_max_schedule_horizon_days(),
            late_runs_after_secs: default_late_runs_after_secs(),
        }
    }
}

/// Read-side limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Page size when none is given, and the largest allowed.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

fn default_limit() -> usize { 200 }

impl Default for ApiConfig {
    fn default() -> Self {
        Self { default_limit: default_limit() }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Extra tracing targets enabled at `level`.
    #[serde(default)]
    pub extra_loggers: Vec<String>,
}

fn default_log_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            extra_loggers: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directive string for this config.
    pub fn filter_directive(&self) -> String {
        let mut directives = vec![
            format!("runloom={}", self.level),
            format!("runloom_scheduler={}", self.level),
            format!("runloom_core={}", self.level),
        ];
        directives.extend(self.extra_loggers.iter().map(|l| format!("{l}={}", self.level)));
        directives.join(",")
    }
}

/// Snapshot store configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Defaults to `~/.runloom/snapshot.json`.
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = RunloomConfig::default();
        assert_eq!(config.api.default_limit, 200);
        assert_eq!(config.scheduler.max_scheduled_runs, 100);
        assert!(!config.test_mode);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RunloomConfig::from_toml(
            r#"
            test_mode = true
            [scheduler]
            loop_interval_secs = 5
            "#,
        )
        .unwrap();
        assert!(config.test_mode);
        assert_eq!(config.scheduler.loop_interval_secs, 5);
        assert_eq!(config.scheduler.late_runs_after_secs, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RunloomConfig::default();
        config
            .apply_env_overrides(vars(&[
                ("RUNLOOM_TEST_MODE", "1"),
                ("RUNLOOM_API_DEFAULT_LIMIT", "50"),
                ("HOME", "/tmp"),
            ]))
            .unwrap();
        assert!(config.test_mode);
        assert_eq!(config.api.default_limit, 50);

        config
            .apply_env_overrides(vars(&[("RUNLOOM_TEST_MODE", "0")]))
            .unwrap();
        assert!(!config.test_mode);
    }

    #[test]
    fn test_extra_loggers_split_and_trimmed() {
        for (value, expected) in [
            ("foo", vec!["foo"]),
            ("foo,bar", vec!["foo", "bar"]),
            ("foo, bar, foobar ", vec!["foo", "bar", "foobar"]),
        ] {
            let mut config = RunloomConfig::default();
            config
                .apply_env_overrides(vars(&[("RUNLOOM_LOGGING_EXTRA_LOGGERS", value)]))
                .unwrap();
            assert_eq!(config.logging.extra_loggers, expected);
        }
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut config = RunloomConfig::default();
        let err = config
            .apply_env_overrides(vars(&[("RUNLOOM_API_DEFAULT_LIMIT", "lots")]))
            .unwrap_err();
        assert!(matches!(err, RunloomError::Config(_)));
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = std::env::temp_dir().join("runloom-test-config");
        let path = dir.join("config.toml");
        let mut config = RunloomConfig::default();
        config.logging.extra_loggers = vec!["hyper".into()];
        config.save_to(&path).unwrap();
        assert_eq!(RunloomConfig::load_from(&path).unwrap(), config);
        std::fs::remove_dir_all(&dir).ok();
    }

    fn profiles_file(name: &str, content: Option<&str>) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("runloom-test-profiles-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("profiles.toml");
        if let Some(content) = content {
            std::fs::write(&path, content).unwrap();
        }
        path
    }

    #[test]
    fn test_load_profiles_without_file() {
        let path = profiles_file("missing", None);
        let profiles = load_profiles(&path).unwrap();
        assert_eq!(profiles.len(), 1);
        assert!(profiles["default"].is_empty());
    }

    #[test]
    fn test_load_profiles_adds_missing_default() {
        let path = profiles_file("no-default", Some("[foo]\nRUNLOOM_TEST_MODE = \"1\"\n"));
        let profiles = load_profiles(&path).unwrap();
        assert_eq!(profiles.keys().collect::<Vec<_>>(), vec!["default", "foo"]);
        assert_eq!(profiles["foo"]["RUNLOOM_TEST_MODE"].as_str(), Some("1"));
    }

    #[test]
    fn test_load_profiles_keeps_explicit_default() {
        let path = profiles_file(
            "with-default",
            Some("[default]\nRUNLOOM_LOGGING_LEVEL = \"warn\"\n\n[foo]\nRUNLOOM_LOGGING_LEVEL = \"debug\"\n"),
        );
        let profiles = load_profiles(&path).unwrap();
        assert_eq!(profiles["default"]["RUNLOOM_LOGGING_LEVEL"].as_str(), Some("warn"));
        assert_eq!(profiles["foo"]["RUNLOOM_LOGGING_LEVEL"].as_str(), Some("debug"));
    }

    #[test]
    fn test_write_profiles_always_includes_default() {
        let path = profiles_file("write-empty", None);
        write_profiles(&path, &Profiles::new()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[default]\n");
    }

    #[test]
    fn test_write_profiles_default_first() {
        let path = profiles_file("write-many", None);
        let mut profiles = Profiles::new();
        let mut alpha = toml::Table::new();
        alpha.insert("RUNLOOM_API_DEFAULT_LIMIT".into(), toml::Value::Integer(1));
        profiles.insert("alpha".into(), alpha);
        let mut default = toml::Table::new();
        default.insert("RUNLOOM_LOGGING_LEVEL".into(), toml::Value::String("warn".into()));
        profiles.insert("default".into(), default);

        write_profiles(&path, &profiles).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[default]\nRUNLOOM_LOGGING_LEVEL = \"warn\"\n\n[alpha]\nRUNLOOM_API_DEFAULT_LIMIT = 1\n"
        );
        assert_eq!(load_profiles(&path).unwrap(), profiles);
    }

    #[test]
    fn test_load_profile_default_and_missing() {
        let path = profiles_file("lookup", None);
        assert!(load_profile(&path, "default").unwrap().is_empty());
        let err = load_profile(&path, "foo").unwrap_err();
        assert_eq!(err.to_string(), "Config error: Profile 'foo' not found.");
    }

    #[test]
    fn test_load_profile_renders_values_as_strings() {
        let path = profiles_file(
            "render",
            Some("[foo]\nRUNLOOM_LOGGING_LEVEL = \"debug\"\nRUNLOOM_TEST_MODE = 1\n"),
        );
        let profile = load_profile(&path, "foo").unwrap();
        assert_eq!(profile["RUNLOOM_LOGGING_LEVEL"], "debug");
        assert_eq!(profile["RUNLOOM_TEST_MODE"], "1");
    }

    #[test]
    fn test_load_profile_rejects_nested_and_unknown_keys() {
        let nested = profiles_file(
            "nested",
            Some("[foo]\nRUNLOOM_TEST_MODE = 1\n\n[foo.nested]\n"),
        );
        let err = load_profile(&nested, "foo").unwrap_err().to_string();
        assert!(err.contains("Unknown setting") && err.contains("'nested'"), "{err}");

        let unknown = profiles_file("unknown", Some("[foo]\ntest = \"unknown-key\"\n"));
        let err = load_profile(&unknown, "foo").unwrap_err().to_string();
        assert!(err.contains("Unknown setting") && err.contains("'test'"), "{err}");
    }

    #[test]
    fn test_apply_profile_then_env_wins() {
        let path = profiles_file(
            "apply",
            Some("[ci]\nRUNLOOM_TEST_MODE = true\nRUNLOOM_API_DEFAULT_LIMIT = 20\n"),
        );
        let mut config = RunloomConfig::default();
        config.apply_profile(&path, "ci").unwrap();
        assert!(config.test_mode);
        assert_eq!(config.api.default_limit, 20);

        config
            .apply_env_overrides(vars(&[("RUNLOOM_API_DEFAULT_LIMIT", "30")]))
            .unwrap();
        assert_eq!(config.api.default_limit, 30);
    }

    #[test]
    fn test_every_setting_is_applied() {
        let mut config = RunloomConfig::default();
        let values: Vec<(String, String)> = SETTINGS
            .iter()
            .map(|s| (format!("RUNLOOM_{s}"), "7".to_string()))
            .map(|(k, v)| match k.as_str() {
                "RUNLOOM_TEST_MODE" => (k, "1".to_string()),
                _ => (k, v),
            })
            .collect();
        config.apply_env_overrides(values).unwrap();
        assert_eq!(config.scheduler.late_runs_after_secs, 7);
        assert_eq!(config.store.snapshot_path.as_deref(), Some("7"));
    }

    #[test]
    fn test_filter_directive() {
        let logging = LoggingConfig {
            level: "debug".into(),
            extra_loggers: vec!["tokio".into()],
        };
        let directive = logging.filter_directive();
        assert!(directive.contains("runloom_scheduler=debug"));
        assert!(directive.ends_with("tokio=debug"));
    }
}
