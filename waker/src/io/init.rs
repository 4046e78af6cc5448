//! Initialization helpers for `.waker/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{WakerConfig, write_config};
use super::state_store::AGENT_STATE_SCHEMA;

/// Canonical paths within `.waker/` for a project root.
#[derive(Debug, Clone)]
pub struct WakerPaths {
    pub root: PathBuf,
    pub waker_dir: PathBuf,
    pub config_path: PathBuf,
    pub schema_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl WakerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let waker_dir = root.join(".waker");
        Self {
            root,
            config_path: waker_dir.join("config.toml"),
            schema_path: waker_dir.join("agent_state.schema.json"),
            gitignore_path: waker_dir.join(".gitignore"),
            waker_dir,
        }
    }
}

/// Create `.waker/` scaffolding in `root`.
///
/// Writes the default config, a copy of the agent document schema and a
/// `.gitignore` for the state directory. Committed agent state is never
/// touched, even with `force`; the first wake cycle creates it.
pub fn init_waker(root: &Path, force: bool) -> Result<WakerPaths> {
    let paths = WakerPaths::new(root);
    if paths.waker_dir.exists() && !paths.waker_dir.is_dir() {
        return Err(anyhow!("waker init: .waker exists but is not a directory"));
    }
    if paths.config_path.exists() && !force {
        return Err(anyhow!(
            "waker init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    let config = WakerConfig::default();
    fs::create_dir_all(&paths.waker_dir)
        .with_context(|| format!("create directory {}", paths.waker_dir.display()))?;
    let state_dir = config.store_dir(root);
    fs::create_dir_all(&state_dir)
        .with_context(|| format!("create directory {}", state_dir.display()))?;

    write_config(&paths.config_path, &config)?;
    write_file(&paths.schema_path, AGENT_STATE_SCHEMA)?;
    write_file(&paths.gitignore_path, WAKER_GITIGNORE)?;
    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const WAKER_GITIGNORE: &str = "state/\n";
