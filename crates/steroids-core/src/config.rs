//! Runtime configuration tree.
//!
//! Loaded from TOML with a resolution chain of CLI flag > env var >
//! project config (`<project>/.steroids/config.toml`) > global config
//! (`~/.steroids/config.toml`) > defaults. Duration values accept
//! `<n>(ms|s|m|h)` strings; a bare number is milliseconds.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use steroids_db::models::ProviderRole;

// -----------------------------------------------------------------------
// Duration strings
// -----------------------------------------------------------------------

/// Parse a duration string: `<n>(ms|s|m|h)`, default unit `ms`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "ms"),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration {raw:?}"))?;
    let duration = match unit.trim() {
        "ms" | "" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => anyhow::bail!("invalid duration unit {other:?} in {raw:?}"),
    };
    Ok(duration)
}

/// A duration that deserializes from either a `<n>(ms|s|m|h)` string or
/// a bare millisecond integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfigDuration(#[serde(serialize_with = "serialize_ms")] pub Duration);

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(ConfigDuration(Duration::from_millis(ms))),
            Raw::Text(s) => parse_duration(&s)
                .map(ConfigDuration)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl From<Duration> for ConfigDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl ConfigDuration {
    pub fn get(self) -> Duration {
        self.0
    }
}

// -----------------------------------------------------------------------
// Sections
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnersConfig {
    pub heartbeat_interval: ConfigDuration,
    pub stale_timeout: ConfigDuration,
    /// Activity timeout for provider subprocesses: the timer resets on
    /// every output chunk.
    pub subprocess_hang_timeout: ConfigDuration,
    pub max_concurrent: usize,
    pub parallel: ParallelConfig,
}

impl Default for RunnersConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30).into(),
            stale_timeout: Duration::from_secs(300).into(),
            subprocess_hang_timeout: Duration::from_secs(120).into(),
            max_concurrent: 4,
            parallel: ParallelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub enabled: bool,
    pub max_clones: usize,
    pub workspace_root: Option<String>,
    pub validation_command: Option<String>,
    pub cleanup_on_success: bool,
    pub cleanup_on_failure: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_clones: 4,
            workspace_root: None,
            validation_command: None,
            cleanup_on_success: true,
            cleanup_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub task_timeout: ConfigDuration,
    pub section_timeout: ConfigDuration,
    /// Consecutive idle time after which an empty-queue runner exits.
    pub wait_timeout: ConfigDuration,
    pub poll_interval: ConfigDuration,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600).into(),
            section_timeout: Duration::from_secs(3600).into(),
            wait_timeout: Duration::from_secs(60).into(),
            poll_interval: Duration::from_secs(5).into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub auto_recover: bool,
    pub max_recovery_attempts: u32,
    pub max_incidents_per_hour: i64,
    pub orphaned_task_timeout: ConfigDuration,
    pub max_coder_duration: ConfigDuration,
    pub max_reviewer_duration: ConfigDuration,
    pub runner_heartbeat_timeout: ConfigDuration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            auto_recover: true,
            max_recovery_attempts: 3,
            max_incidents_per_hour: 10,
            orphaned_task_timeout: Duration::from_secs(600).into(),
            max_coder_duration: Duration::from_secs(1800).into(),
            max_reviewer_duration: Duration::from_secs(900).into(),
            runner_heartbeat_timeout: Duration::from_secs(300).into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleAiConfig {
    pub provider: String,
    pub model: String,
}

impl Default for RoleAiConfig {
    fn default() -> Self {
        Self {
            provider: "claude".to_string(),
            model: "claude-sonnet-4-5".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub orchestrator: RoleAiConfig,
    pub coder: RoleAiConfig,
    pub reviewer: RoleAiConfig,
    /// Additional reviewers; when non-empty the full panel is
    /// `reviewer` plus these, invoked in parallel.
    pub reviewers: Vec<RoleAiConfig>,
}

impl AiConfig {
    pub fn for_role(&self, role: ProviderRole) -> &RoleAiConfig {
        match role {
            ProviderRole::Coder => &self.coder,
            ProviderRole::Reviewer => &self.reviewer,
            ProviderRole::Orchestrator => &self.orchestrator,
        }
    }

    /// The reviewer panel: the primary reviewer followed by any extras.
    pub fn reviewer_panel(&self) -> Vec<RoleAiConfig> {
        let mut panel = vec![self.reviewer.clone()];
        panel.extend(self.reviewers.iter().cloned());
        panel
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub auto_push: bool,
    pub remote: String,
    pub branch: Option<String>,
    pub retry_on_failure: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_push: false,
            remote: "origin".to_string(),
            branch: None,
            retry_on_failure: true,
        }
    }
}

// -----------------------------------------------------------------------
// Root
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runners: RunnersConfig,
    pub locking: LockingConfig,
    pub health: HealthConfig,
    pub ai: AiConfig,
    pub git: GitConfig,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse config")
    }

    /// Load a config file; a missing file yields defaults.
    pub fn load_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml(&raw)
                .with_context(|| format!("invalid config at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Load the effective config for a project: global file first,
    /// project file layered over it (section-level replacement), then
    /// env overrides.
    pub fn load_for_project(global_path: &Path, project_config_path: &Path) -> Result<Self> {
        let mut config = Self::load_file(global_path)?;

        if project_config_path.exists() {
            let raw = std::fs::read_to_string(project_config_path).with_context(|| {
                format!("failed to read {}", project_config_path.display())
            })?;
            let overlay: toml::Value = toml::from_str(&raw).with_context(|| {
                format!("invalid config at {}", project_config_path.display())
            })?;
            let mut base = toml::Value::try_from(&config).context("config re-serialization")?;
            merge_toml(&mut base, overlay);
            config = base.try_into().context("failed to merge project config")?;
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply env-var overrides. `STEROIDS_TIMEOUT` replaces the default
    /// invocation activity timeout.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("STEROIDS_TIMEOUT") {
            self.runners.subprocess_hang_timeout = parse_duration(&raw)
                .context("invalid STEROIDS_TIMEOUT")?
                .into();
        }
        Ok(())
    }
}

/// Recursively merge `overlay` into `base`: tables merge key-by-key,
/// everything else replaces.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base_slot, value) => *base_slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.runners.heartbeat_interval.get(), Duration::from_secs(30));
        assert_eq!(config.locking.poll_interval.get(), Duration::from_secs(5));
        assert_eq!(config.health.max_incidents_per_hour, 10);
        assert_eq!(
            config.health.orphaned_task_timeout.get(),
            Duration::from_secs(600)
        );
        assert_eq!(config.health.max_coder_duration.get(), Duration::from_secs(1800));
        assert_eq!(
            config.health.max_reviewer_duration.get(),
            Duration::from_secs(900)
        );
        assert_eq!(
            config.health.runner_heartbeat_timeout.get(),
            Duration::from_secs(300)
        );
        assert!(!config.git.auto_push);
    }

    #[test]
    fn parses_duration_strings_in_toml() {
        let config = Config::from_toml(
            r#"
            [runners]
            heartbeat_interval = "15s"
            subprocess_hang_timeout = 90000

            [ai.coder]
            provider = "claude"
            model = "custom-model"
            "#,
        )
        .unwrap();
        assert_eq!(config.runners.heartbeat_interval.get(), Duration::from_secs(15));
        assert_eq!(
            config.runners.subprocess_hang_timeout.get(),
            Duration::from_secs(90)
        );
        assert_eq!(config.ai.coder.model, "custom-model");
        // Untouched sections keep defaults.
        assert_eq!(config.locking.poll_interval.get(), Duration::from_secs(5));
    }

    #[test]
    fn project_overlay_wins_over_global() {
        let tmp = tempfile::tempdir().unwrap();
        let global = tmp.path().join("global.toml");
        let project = tmp.path().join("project.toml");
        std::fs::write(
            &global,
            "[ai.coder]\nprovider = \"claude\"\nmodel = \"global-model\"\n\
             [git]\nauto_push = true\n",
        )
        .unwrap();
        std::fs::write(&project, "[ai.coder]\nmodel = \"project-model\"\n").unwrap();

        let config = Config::load_for_project(&global, &project).unwrap();
        assert_eq!(config.ai.coder.model, "project-model");
        assert_eq!(config.ai.coder.provider, "claude");
        assert!(config.git.auto_push, "global keys survive the overlay");
    }

    #[test]
    fn missing_files_yield_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_for_project(
            &tmp.path().join("absent-global.toml"),
            &tmp.path().join("absent-project.toml"),
        )
        .unwrap();
        assert_eq!(config.runners.max_concurrent, 4);
    }
}
