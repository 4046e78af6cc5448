//! `waker`: run and inspect the wake cycle of one agent instance.
//!
//! State lives under `.waker/` in the project root: `config.toml`, the
//! agent-state schema, and (for the file store) one JSON document per
//! committed version.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use waker::bootstrap::open_project;
use waker::core::types::{Priority, TaskAction};
use waker::exit_codes;
use waker::io::init::init_waker;
use waker::logging;
use waker::looping::run_loop;

#[derive(Parser)]
#[command(
    name = "waker",
    version,
    about = "Wake-cycle orchestrator for a periodically triggered agent"
)]
struct Cli {
    /// Project directory (contains .waker/)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.waker/config.toml`, the state schema and the state directory.
    Init {
        /// Overwrite an existing config. Committed state is never touched.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one wake cycle and print its report as JSON.
    Wake,
    /// Wake every `wake_interval_secs` until Ctrl-C or `--max-cycles`.
    Run {
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Append a pending task and commit it; prints the new task id.
    Enqueue(EnqueueArgs),
    /// Print the status projection of the last committed state as JSON.
    Status,
}

#[derive(Args)]
struct EnqueueArgs {
    #[arg(long)]
    name: String,

    #[arg(long, default_value = "")]
    description: String,

    /// low, normal or high
    #[arg(long, default_value_t = Priority::Normal)]
    priority: Priority,

    /// Call a tool instead of planning: SERVER/TOOL
    #[arg(long, value_name = "SERVER/TOOL", conflicts_with_all = ["marketplace", "marketplace_job", "diff_file"])]
    tool: Option<String>,

    /// JSON arguments for `--tool`
    #[arg(long, requires = "tool")]
    arguments: Option<String>,

    /// Refresh the earnings summary of a marketplace
    #[arg(long, value_name = "NAME", conflicts_with_all = ["marketplace_job", "diff_file"])]
    marketplace: Option<String>,

    /// Marketplace write: NAME/OPERATION/JOB_ID
    #[arg(long, value_name = "NAME/OPERATION/JOB_ID", conflicts_with = "diff_file")]
    marketplace_job: Option<String>,

    /// Propose the unified diff in PATH on the code host
    #[arg(long, value_name = "PATH")]
    diff_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    logging::init("warn");
    if let Err(err) = run().await {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::for_error(&err));
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Wake => cmd_wake(&cli.root).await,
        Command::Run { max_cycles } => cmd_run(&cli.root, max_cycles).await,
        Command::Enqueue(args) => cmd_enqueue(&cli.root, args).await,
        Command::Status => cmd_status(&cli.root).await,
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let paths = init_waker(root, force)?;
    println!("{}", paths.config_path.display());
    Ok(())
}

async fn cmd_wake(root: &Path) -> Result<()> {
    let project = open_project(root)?;
    let report = project.orchestrator.trigger_cycle().await?;
    print_json(&report)
}

async fn cmd_run(root: &Path, max_cycles: Option<u64>) -> Result<()> {
    let project = open_project(root)?;
    let interval = project.config.wake_interval();
    info!(interval_secs = interval.as_secs(), ?max_cycles, "starting wake loop");

    let shutdown = async {
        // Without a signal handler the loop only stops at max cycles.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let outcome = run_loop(
        &project.orchestrator,
        interval,
        max_cycles,
        shutdown,
        |result| match result {
            Ok(report) => {
                if let Err(err) = print_json(report) {
                    eprintln!("{:#}", err);
                }
            }
            Err(err) => eprintln!("wake failed: {err}"),
        },
    )
    .await;
    info!(
        cycles = outcome.cycles_run,
        committed = outcome.committed,
        failed = outcome.failed,
        stop = ?outcome.stop,
        "wake loop stopped"
    );
    Ok(())
}

async fn cmd_enqueue(root: &Path, args: EnqueueArgs) -> Result<()> {
    let action = action_from_args(&args)?;
    let project = open_project(root)?;
    let id = project
        .orchestrator
        .enqueue_task_with_action(&args.name, &args.description, args.priority, action)
        .await?;
    println!("{id}");
    Ok(())
}

async fn cmd_status(root: &Path) -> Result<()> {
    let project = open_project(root)?;
    let status = project.orchestrator.get_status().await?;
    print_json(&status)
}

fn action_from_args(args: &EnqueueArgs) -> Result<TaskAction> {
    if let Some(target) = &args.tool {
        let (server, tool) = target
            .split_once('/')
            .ok_or_else(|| anyhow!("--tool expects SERVER/TOOL, got '{target}'"))?;
        let arguments = match &args.arguments {
            Some(raw) => serde_json::from_str(raw).context("parse --arguments as JSON")?,
            None => Value::Object(serde_json::Map::new()),
        };
        return Ok(TaskAction::Tool {
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
        });
    }
    if let Some(marketplace) = &args.marketplace {
        return Ok(TaskAction::MarketplaceSync {
            marketplace: marketplace.clone(),
        });
    }
    if let Some(target) = &args.marketplace_job {
        let parts: Vec<&str> = target.splitn(3, '/').collect();
        let [marketplace, operation, job_id] = parts.as_slice() else {
            bail!("--marketplace-job expects NAME/OPERATION/JOB_ID, got '{target}'");
        };
        return Ok(TaskAction::MarketplaceJob {
            marketplace: marketplace.to_string(),
            operation: operation.to_string(),
            job_id: job_id.to_string(),
            payload: Value::Null,
        });
    }
    if let Some(path) = &args.diff_file {
        let diff = std::fs::read_to_string(path)
            .with_context(|| format!("read diff {}", path.display()))?;
        return Ok(TaskAction::ProposeChange { diff });
    }
    Ok(TaskAction::Plan)
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(args: &[&str]) -> EnqueueArgs {
        let cli = Cli::parse_from(["waker", "enqueue", "--name", "job"].iter().chain(args));
        match cli.command {
            Command::Enqueue(args) => args,
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["waker", "--root", "/tmp/agent", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.root, PathBuf::from("/tmp/agent"));
    }

    #[test]
    fn parse_run_with_max_cycles() {
        let cli = Cli::parse_from(["waker", "run", "--max-cycles", "2"]);
        assert!(matches!(cli.command, Command::Run { max_cycles: Some(2) }));
    }

    #[test]
    fn enqueue_defaults_to_normal_planning_task() {
        let args = enqueue(&[]);
        assert_eq!(args.priority, Priority::Normal);
        assert_eq!(action_from_args(&args).expect("action"), TaskAction::Plan);
    }

    #[test]
    fn enqueue_tool_parses_arguments() {
        let args = enqueue(&[
            "--priority",
            "high",
            "--tool",
            "n8n/workflow_list",
            "--arguments",
            r#"{"active":true}"#,
        ]);
        assert_eq!(args.priority, Priority::High);
        assert_eq!(
            action_from_args(&args).expect("action"),
            TaskAction::Tool {
                server: "n8n".to_string(),
                tool: "workflow_list".to_string(),
                arguments: serde_json::json!({"active": true}),
            }
        );
    }

    #[test]
    fn enqueue_marketplace_job_needs_three_parts() {
        let args = enqueue(&["--marketplace-job", "clawgig/bid"]);
        let err = action_from_args(&args).expect_err("two parts");
        assert!(err.to_string().contains("NAME/OPERATION/JOB_ID"));

        let args = enqueue(&["--marketplace-job", "clawgig/bid/job-7"]);
        assert!(matches!(
            action_from_args(&args).expect("action"),
            TaskAction::MarketplaceJob { job_id, .. } if job_id == "job-7"
        ));
    }

    #[test]
    fn enqueue_actions_are_mutually_exclusive() {
        let result = Cli::try_parse_from([
            "waker",
            "enqueue",
            "--name",
            "job",
            "--tool",
            "n8n/x",
            "--marketplace",
            "clawgig",
        ]);
        assert!(result.is_err());
    }
}
