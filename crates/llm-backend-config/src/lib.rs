//! Backend settings.
//!
//! Resolution order: built-in defaults, then an optional JSON settings file,
//! then `BACKEND_*` environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which execution strategy hosts the workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Thread,
    Process,
    Cooperative,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" | "threaded" => Ok(Self::Thread),
            "process" | "multiprocessing" => Ok(Self::Process),
            "cooperative" | "async" => Ok(Self::Cooperative),
            other => Err(format!("Unknown execution strategy: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Root for backend state (database, logs).
    pub working_directory: PathBuf,
    /// SQLite path. Defaults to `<working_directory>/backend.db`.
    pub database_path: Option<PathBuf>,
    pub strategy: StrategyKind,
    /// How often idle workers re-check their shutdown signal.
    pub poll_interval_ms: u64,
    /// Bounded wait for a worker to stop before it is forced.
    pub join_timeout_ms: u64,
    /// Bounded wait for a worker to report its model loaded.
    pub load_timeout_ms: u64,
    /// Default generate timeout. `None` waits as long as the worker lives.
    pub generate_timeout_ms: Option<u64>,
    pub log_level: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("data/backend"),
            database_path: None,
            strategy: StrategyKind::Thread,
            poll_interval_ms: 500,
            join_timeout_ms: 5_000,
            load_timeout_ms: 120_000,
            generate_timeout_ms: None,
            log_level: "info".to_string(),
        }
    }
}

impl BackendSettings {
    /// Defaults, overlaid by `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let env: HashMap<String, String> = std::env::vars().collect();
        settings.apply_env(&env)?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings {}: {e}", path.display()))?;
        serde_json::from_str(&text)
            .map_err(|e| format!("Failed to parse settings {}: {e}", path.display()))
    }

    /// Apply `BACKEND_*` overrides from an environment snapshot.
    pub fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), String> {
        if let Some(dir) = env.get("BACKEND_PATH") {
            self.working_directory = PathBuf::from(dir);
        }
        if let Some(db) = env.get("BACKEND_DATABASE") {
            self.database_path = Some(PathBuf::from(db.trim_start_matches("sqlite:///")));
        }
        if let Some(strategy) = env.get("BACKEND_STRATEGY") {
            self.strategy = strategy.parse()?;
        }
        if let Some(ms) = env_millis(env, "BACKEND_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = ms;
        }
        if let Some(ms) = env_millis(env, "BACKEND_JOIN_TIMEOUT_MS")? {
            self.join_timeout_ms = ms;
        }
        if let Some(ms) = env_millis(env, "BACKEND_LOAD_TIMEOUT_MS")? {
            self.load_timeout_ms = ms;
        }
        if let Some(ms) = env_millis(env, "BACKEND_GENERATE_TIMEOUT_MS")? {
            // 0 disables the default timeout
            self.generate_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(level) = env.get("BACKEND_LOG_LEVEL") {
            self.log_level = level.clone();
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.working_directory.join("backend.db"))
    }

    pub fn log_directory(&self) -> PathBuf {
        self.working_directory.join("logs")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn generate_timeout(&self) -> Option<Duration> {
        self.generate_timeout_ms.map(Duration::from_millis)
    }

    /// `log` level filter; unknown names fall back to `Info`.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', using info", self.log_level);
            log::LevelFilter::Info
        })
    }
}

fn env_millis(env: &HashMap<String, String>, key: &str) -> Result<Option<u64>, String> {
    env.get(key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| format!("Invalid {key}={v}: {e}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = BackendSettings::default();
        assert_eq!(settings.strategy, StrategyKind::Thread);
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.database_path(), PathBuf::from("data/backend/backend.db"));
        assert!(settings.generate_timeout().is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = BackendSettings::default();
        settings
            .apply_env(&env(&[
                ("BACKEND_PATH", "/srv/llm"),
                ("BACKEND_DATABASE", "sqlite:////srv/llm/state.db"),
                ("BACKEND_STRATEGY", "Process"),
                ("BACKEND_JOIN_TIMEOUT_MS", "250"),
                ("BACKEND_GENERATE_TIMEOUT_MS", "30000"),
            ]))
            .unwrap();

        assert_eq!(settings.working_directory, PathBuf::from("/srv/llm"));
        assert_eq!(settings.database_path(), PathBuf::from("/srv/llm/state.db"));
        assert_eq!(settings.strategy, StrategyKind::Process);
        assert_eq!(settings.join_timeout(), Duration::from_millis(250));
        assert_eq!(settings.generate_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(settings.log_directory(), PathBuf::from("/srv/llm/logs"));
    }

    #[test]
    fn test_zero_generate_timeout_disables_it() {
        let mut settings = BackendSettings {
            generate_timeout_ms: Some(10),
            ..BackendSettings::default()
        };
        settings
            .apply_env(&env(&[("BACKEND_GENERATE_TIMEOUT_MS", "0")]))
            .unwrap();
        assert!(settings.generate_timeout().is_none());
    }

    #[test]
    fn test_invalid_env_values_are_errors() {
        let mut settings = BackendSettings::default();
        assert!(settings
            .apply_env(&env(&[("BACKEND_STRATEGY", "gpu")]))
            .is_err());
        assert!(settings
            .apply_env(&env(&[("BACKEND_POLL_INTERVAL_MS", "soon")]))
            .is_err());
    }

    #[test]
    fn test_partial_settings_file_keeps_defaults() {
        let settings: BackendSettings =
            serde_json::from_str(r#"{"strategy":"cooperative","poll_interval_ms":50}"#).unwrap();
        assert_eq!(settings.strategy, StrategyKind::Cooperative);
        assert_eq!(settings.poll_interval_ms, 50);
        assert_eq!(settings.join_timeout_ms, 5_000);
    }

    #[test]
    fn test_level_filter() {
        let settings = BackendSettings {
            log_level: "debug".to_string(),
            ..BackendSettings::default()
        };
        assert_eq!(settings.level_filter(), log::LevelFilter::Debug);
    }
}
