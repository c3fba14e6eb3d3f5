use std::path::PathBuf;

use figment::{Figment, providers::{Format, Toml, Env}};
use serde::{Deserialize, Serialize};

use crate::error::{MarvinError, Result};

// Scheduler service defaults. All of them can be overridden per job at
// creation time except the store location and the per-tenant quota.
pub const DEFAULT_BOT_NAME: &str = "marvin";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_MAX_JOBS_PER_CHAT: usize = 20;
pub const DEFAULT_MAX_RUN_MS: i64 = 600_000; // 10 minutes per run
pub const DEFAULT_MAX_LATENESS_MS: i64 = 3_600_000; // stale one-shots older than 1h are dropped
pub const DEFAULT_RETRY_MAX: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: i64 = 30_000;

/// Top-level config (marvin.toml + MARVIN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarvinConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Scheduler service knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Root directory for persisted state; jobs live at
    /// `<store_path>/<bot_name>/jobs.json`.
    pub store_path: PathBuf,
    /// Namespace for the store file; fixed at job creation.
    pub bot_name: String,
    /// Service-level kill switch. When false, jobs are loaded and can be
    /// managed but no triggers are armed and nothing is dispatched.
    pub enabled: bool,
    /// IANA timezone applied to cron jobs that do not name one.
    pub default_timezone: String,
    /// Per-tenant job quota.
    pub max_jobs_per_chat: usize,
    /// Upper bound on a single executor run (floored at 5s by the engine).
    pub max_run_ms: i64,
    /// Policy values applied when a job omits or mis-specifies its own.
    pub default_policy: DefaultRunPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            bot_name: DEFAULT_BOT_NAME.to_string(),
            enabled: true,
            default_timezone: DEFAULT_TIMEZONE.to_string(),
            max_jobs_per_chat: DEFAULT_MAX_JOBS_PER_CHAT,
            max_run_ms: DEFAULT_MAX_RUN_MS,
            default_policy: DefaultRunPolicy::default(),
        }
    }
}

/// Defaults for the per-job run policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultRunPolicy {
    pub max_lateness_ms: i64,
    pub retry_max: u32,
    pub retry_backoff_ms: i64,
    pub delete_after_run: bool,
}

impl Default for DefaultRunPolicy {
    fn default() -> Self {
        Self {
            max_lateness_ms: DEFAULT_MAX_LATENESS_MS,
            retry_max: DEFAULT_RETRY_MAX,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            delete_after_run: false,
        }
    }
}

impl MarvinConfig {
    /// Load config from a TOML file with MARVIN_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.marvin/marvin.toml
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MarvinConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MARVIN_").split("_"))
            .extract()
            .map_err(|e| MarvinError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.marvin/marvin.toml", home)
}

fn default_store_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".marvin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults_are_sane() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.bot_name, "marvin");
        assert!(cfg.enabled);
        assert_eq!(cfg.default_timezone, "UTC");
        assert_eq!(cfg.max_jobs_per_chat, DEFAULT_MAX_JOBS_PER_CHAT);
        assert_eq!(cfg.max_run_ms, DEFAULT_MAX_RUN_MS);
        assert_eq!(cfg.default_policy.retry_max, DEFAULT_RETRY_MAX);
        assert!(!cfg.default_policy.delete_after_run);
    }

    #[test]
    fn load_from_explicit_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("marvin.toml");
        std::fs::write(
            &path,
            "[scheduler]\nbot_name = \"wall-e\"\nmax_jobs_per_chat = 3\n",
        )
        .expect("write config");

        let cfg = MarvinConfig::load(path.to_str()).expect("load");
        assert_eq!(cfg.scheduler.bot_name, "wall-e");
        assert_eq!(cfg.scheduler.max_jobs_per_chat, 3);
        // Untouched knobs keep their defaults.
        assert_eq!(cfg.scheduler.default_timezone, "UTC");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = MarvinConfig::load(Some("/nonexistent/marvin.toml")).expect("load");
        assert_eq!(cfg.scheduler.bot_name, "marvin");
    }

    #[test]
    fn error_code_for_config() {
        let err = MarvinError::Config("boom".into());
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("boom"));
    }
}
