//! Agent configuration stored under `.waker/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

static AGENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("agent id pattern"));

/// Agent configuration (TOML).
///
/// Edited by humans; every table takes documented defaults for missing
/// fields so a partial file stays valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WakerConfig {
    /// Key of the persisted agent document.
    pub agent_id: String,

    /// Seconds between scheduled wake cycles.
    pub wake_interval_secs: u64,

    pub cycle: CycleSettings,
    pub store: StoreSettings,
    pub planner: PlannerSettings,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_servers: Vec<ToolServerSettings>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub marketplaces: Vec<MarketplaceSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_host: Option<CodeHostSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CycleSettings {
    pub max_tasks_per_cycle: usize,
    /// Failed attempts after which a task is terminally failed.
    pub retry_ceiling: u32,
    pub history_cap: usize,
    /// Wake records included in the status report.
    pub recent_history: usize,
    pub task_timeout_secs: u64,
    pub store_timeout_secs: u64,
    /// Wall-clock budget for executing tasks in one cycle.
    pub cycle_budget_secs: u64,
    /// Reload-and-retry attempts after a version conflict.
    pub commit_retry_limit: u32,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            max_tasks_per_cycle: 5,
            retry_ceiling: 3,
            history_cap: 100,
            recent_history: 10,
            task_timeout_secs: 120,
            store_timeout_secs: 10,
            cycle_budget_secs: 600,
            commit_retry_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSettings {
    pub kind: StoreKind,
    /// Relative paths resolve against the project root.
    pub dir: PathBuf,
    /// Committed versions kept on disk by the file store.
    pub retain_versions: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::File,
            dir: PathBuf::from(".waker/state"),
            retain_versions: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerSettings {
    /// Planner argv. Empty selects the built-in local planner.
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolServerSettings {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketplaceSettings {
    pub name: String,
    #[serde(default)]
    pub earned: f64,
    #[serde(default)]
    pub pending: f64,
    #[serde(default)]
    pub jobs_completed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeHostSettings {
    pub repo: PathBuf,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_branch_prefix() -> String {
    "waker".to_string()
}

impl Default for WakerConfig {
    fn default() -> Self {
        Self {
            agent_id: "default".to_string(),
            wake_interval_secs: 15 * 60,
            cycle: CycleSettings::default(),
            store: StoreSettings::default(),
            planner: PlannerSettings::default(),
            tool_servers: Vec::new(),
            marketplaces: Vec::new(),
            code_host: None,
        }
    }
}

/// Knobs of one wake cycle, resolved to durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleConfig {
    pub max_tasks_per_cycle: usize,
    pub retry_ceiling: u32,
    pub history_cap: usize,
    pub recent_history: usize,
    pub task_timeout: Duration,
    pub store_timeout: Duration,
    pub cycle_budget: Duration,
    pub commit_retry_limit: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        CycleSettings::default().to_cycle_config()
    }
}

impl CycleSettings {
    pub fn to_cycle_config(&self) -> CycleConfig {
        CycleConfig {
            max_tasks_per_cycle: self.max_tasks_per_cycle,
            retry_ceiling: self.retry_ceiling,
            history_cap: self.history_cap,
            recent_history: self.recent_history,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            cycle_budget: Duration::from_secs(self.cycle_budget_secs),
            commit_retry_limit: self.commit_retry_limit,
        }
    }
}

impl WakerConfig {
    pub fn validate(&self) -> Result<()> {
        if !AGENT_ID_RE.is_match(&self.agent_id) {
            return Err(anyhow!(
                "agent_id '{}' must match [A-Za-z0-9][A-Za-z0-9_.-]*",
                self.agent_id
            ));
        }
        if self.wake_interval_secs == 0 {
            return Err(anyhow!("wake_interval_secs must be > 0"));
        }
        let cycle = &self.cycle;
        for (name, value) in [
            ("cycle.task_timeout_secs", cycle.task_timeout_secs),
            ("cycle.store_timeout_secs", cycle.store_timeout_secs),
            ("cycle.cycle_budget_secs", cycle.cycle_budget_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if cycle.retry_ceiling == 0 {
            return Err(anyhow!("cycle.retry_ceiling must be > 0"));
        }
        if cycle.history_cap == 0 {
            return Err(anyhow!("cycle.history_cap must be > 0"));
        }
        if self.store.retain_versions == 0 {
            return Err(anyhow!("store.retain_versions must be > 0"));
        }
        if self.planner.output_limit_bytes == 0 {
            return Err(anyhow!("planner.output_limit_bytes must be > 0"));
        }
        if let Some(program) = self.planner.command.first()
            && program.trim().is_empty()
        {
            return Err(anyhow!("planner.command[0] must not be blank"));
        }
        check_unique("tool_servers", self.tool_servers.iter().map(|s| s.name.as_str()))?;
        check_unique("marketplaces", self.marketplaces.iter().map(|m| m.name.as_str()))?;
        for market in &self.marketplaces {
            if !(market.earned.is_finite() && market.pending.is_finite()) {
                return Err(anyhow!(
                    "marketplaces '{}': earned and pending must be finite numbers",
                    market.name
                ));
            }
        }
        if let Some(host) = &self.code_host
            && host.branch_prefix.trim_matches('/').is_empty()
        {
            return Err(anyhow!("code_host.branch_prefix must not be blank"));
        }
        Ok(())
    }

    /// Store directory resolved against `root`.
    pub fn store_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.store.dir)
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_secs(self.wake_interval_secs)
    }
}

fn check_unique<'a>(table: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(anyhow!("{table}: name must not be blank"));
        }
        if !seen.insert(name) {
            return Err(anyhow!("{table}: duplicate name '{name}'"));
        }
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WakerConfig::default()`.
pub fn load_config(path: &Path) -> Result<WakerConfig> {
    if !path.exists() {
        let cfg = WakerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WakerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WakerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, WakerConfig::default());
        assert_eq!(cfg.wake_interval(), Duration::from_secs(900));
        assert_eq!(cfg.cycle.retry_ceiling, 3);
        assert_eq!(cfg.cycle.max_tasks_per_cycle, 5);
    }

    #[test]
    fn write_then_load_preserves_every_table() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = WakerConfig {
            agent_id: "optimus".to_string(),
            tool_servers: vec![ToolServerSettings {
                name: "n8n".to_string(),
                tools: vec!["workflow_list".to_string()],
            }],
            marketplaces: vec![MarketplaceSettings {
                name: "clawgig".to_string(),
                earned: 18.5,
                pending: 42.0,
                jobs_completed: 2,
            }],
            code_host: Some(CodeHostSettings {
                repo: PathBuf::from("/srv/agent"),
                branch_prefix: "agent".to_string(),
            }),
            ..WakerConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_takes_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "agent_id = \"scout\"\n[cycle]\nretry_ceiling = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.agent_id, "scout");
        assert_eq!(cfg.cycle.retry_ceiling, 5);
        assert_eq!(cfg.cycle.history_cap, 100);
        assert_eq!(cfg.store.kind, StoreKind::File);
    }

    #[test]
    fn rejects_invalid_values() {
        let bad_id = WakerConfig {
            agent_id: "../escape".to_string(),
            ..WakerConfig::default()
        };
        assert!(bad_id.validate().is_err());

        let mut zero_ceiling = WakerConfig::default();
        zero_ceiling.cycle.retry_ceiling = 0;
        assert!(zero_ceiling.validate().is_err());

        let mut dup = WakerConfig::default();
        dup.tool_servers = vec![
            ToolServerSettings {
                name: "n8n".to_string(),
                tools: Vec::new(),
            },
            ToolServerSettings {
                name: "n8n".to_string(),
                tools: Vec::new(),
            },
        ];
        let err = dup.validate().expect_err("duplicate");
        assert!(err.to_string().contains("duplicate name 'n8n'"));
    }

    #[test]
    fn non_finite_marketplace_figures_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[[marketplaces]]\nname = \"clawgig\"\nearned = nan\npending = 3.5\n",
        )
        .expect("write");
        let err = load_config(&path).expect_err("nan earnings");
        assert!(format!("{err:#}").contains("must be finite"));

        let mut infinite = WakerConfig::default();
        infinite.marketplaces = vec![MarketplaceSettings {
            name: "clawgig".to_string(),
            earned: 1.0,
            pending: f64::INFINITY,
            jobs_completed: 0,
        }];
        assert!(infinite.validate().is_err());
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "wake_interval_secs = \"soon\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
