//! Assemble an [`Orchestrator`] from a project root and its config.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::code_host::GitCodeHost;
use crate::io::command_planner::CommandPlanner;
use crate::io::config::{StoreKind, WakerConfig, load_config};
use crate::io::file_store::FileStateStore;
use crate::io::init::WakerPaths;
use crate::io::local_ports::{LocalPlanner, StaticEarnings, StaticMarketplace, StaticToolServer};
use crate::io::memory_store::InMemoryStateStore;
use crate::io::ports::PortRegistry;
use crate::io::state_store::StateStore;
use crate::io::tool_catalog::ToolPort;
use crate::orchestrator::Orchestrator;

/// A loaded project: its config and the orchestrator built from it.
#[derive(Debug)]
pub struct Project {
    pub paths: WakerPaths,
    pub config: WakerConfig,
    pub orchestrator: Orchestrator,
}

/// Load `.waker/config.toml` under `root` (defaults when missing) and build
/// the orchestrator.
pub fn open_project(root: &Path) -> Result<Project> {
    let paths = WakerPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let orchestrator = build_orchestrator(root, &config)?;
    Ok(Project {
        paths,
        config,
        orchestrator,
    })
}

pub fn build_orchestrator(root: &Path, config: &WakerConfig) -> Result<Orchestrator> {
    let store = build_store(root, config);
    let ports = build_ports(root, config)?;
    debug!(agent = %config.agent_id, ports = ?ports, "orchestrator assembled");
    Ok(Orchestrator::new(
        store,
        ports,
        config.cycle.to_cycle_config(),
    ))
}

pub fn build_store(root: &Path, config: &WakerConfig) -> Arc<dyn StateStore> {
    match config.store.kind {
        StoreKind::File => Arc::new(FileStateStore::new(
            config.store_dir(root),
            config.agent_id.clone(),
            config.store.retain_versions,
        )),
        StoreKind::Memory => Arc::new(InMemoryStateStore::new(config.agent_id.clone())),
    }
}

/// The planner command may run no longer than the cycle allows one task.
fn command_planner(config: &WakerConfig) -> Result<CommandPlanner> {
    let planner = CommandPlanner::new(&config.planner.command, config.planner.output_limit_bytes)
        .context("configure planner")?;
    Ok(planner.with_timeout(config.cycle.to_cycle_config().task_timeout))
}

pub fn build_ports(root: &Path, config: &WakerConfig) -> Result<PortRegistry> {
    let mut ports = if config.planner.command.is_empty() {
        PortRegistry::new().with_planner(Arc::new(LocalPlanner))
    } else {
        PortRegistry::new().with_planner(Arc::new(command_planner(config)?))
    };

    for server in &config.tool_servers {
        ports = ports.with_tool_server(Arc::new(ToolPort::new(StaticToolServer::new(
            server.name.clone(),
            server.tools.clone(),
        ))));
    }
    for market in &config.marketplaces {
        ports = ports.with_marketplace(Arc::new(StaticMarketplace::new(
            market.name.clone(),
            StaticEarnings {
                earned_usd: market.earned,
                pending_usd: market.pending,
                jobs_completed: market.jobs_completed,
            },
        )));
    }
    if let Some(host) = &config.code_host {
        let repo = resolve(root, &host.repo);
        ports = ports.with_code_host(Arc::new(GitCodeHost::new(repo, host.branch_prefix.clone())));
    }
    Ok(ports)
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
