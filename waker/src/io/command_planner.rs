//! Planner port backed by an external command.
//!
//! The task is rendered into a prompt and piped to the command's stdin. The
//! command must print `{"steps": [...]}` on stdout; an empty list means the
//! task needs no plan.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use minijinja::{Environment, context};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::io::ports::{
    CapabilityPort, CapabilityRequest, CapabilityResponse, Invocation, PlanStep, PortFailure,
};
use crate::io::process::{CancelFlag, run_command_with_timeout};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");

/// Upper bound on a single planner run when no task timeout is configured.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct PlannerReply {
    steps: Vec<String>,
}

pub struct CommandPlanner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    env: Environment<'static>,
}

impl CommandPlanner {
    /// `command` is the argv, e.g. `["llm", "-m", "gpt-4o"]`.
    pub fn new(command: &[String], output_limit_bytes: usize) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("planner command must not be empty"))?;
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .context("load planner template")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            output_limit_bytes,
            env,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn render_prompt(&self, key: &str, name: &str, description: &str) -> Result<String> {
        let template = self.env.get_template("planner")?;
        let rendered = template.render(context! {
            key => key,
            name => name.trim(),
            description => (!description.trim().is_empty()).then(|| description.trim()),
        })?;
        Ok(rendered)
    }

    #[instrument(skip_all, fields(program = %self.program, key = %key))]
    async fn run(&self, key: &str, prompt: String) -> Result<CapabilityResponse, PortFailure> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;

        // Dropping this future (the cycle's task timeout) kills the command.
        let cancel = CancelFlag::default();
        let _kill_on_drop = cancel.cancel_on_drop();
        let output = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(cmd, Some(prompt.as_bytes()), timeout, limit, &cancel)
        })
        .await
        .map_err(|err| PortFailure::Unavailable(format!("planner worker failed: {err}")))?
        .map_err(|err| PortFailure::Unavailable(format!("{err:#}")))?;

        if output.timed_out {
            return Err(PortFailure::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            });
        }
        if !output.status.success() {
            let tail = output.stderr_tail();
            warn!(exit_code = ?output.status.code(), stderr = %tail, "planner command failed");
            return Err(PortFailure::Rejected(format!(
                "planner exited with {}: {tail}",
                output.status
            )));
        }
        if output.stdout_truncated > 0 {
            return Err(PortFailure::Rejected(format!(
                "planner output exceeded {limit} bytes"
            )));
        }
        let response = parse_reply(&output.stdout)?;
        debug!(summary = %response.summary(), "planner replied");
        Ok(response)
    }
}

fn parse_reply(stdout: &[u8]) -> Result<CapabilityResponse, PortFailure> {
    let text = String::from_utf8_lossy(stdout);
    let reply: PlannerReply = serde_json::from_str(text.trim())
        .map_err(|err| PortFailure::Rejected(format!("planner reply is not valid JSON: {err}")))?;
    let steps: Vec<PlanStep> = reply
        .steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .zip(1u32..)
        .map(|(summary, order)| PlanStep { order, summary })
        .collect();
    if steps.is_empty() {
        return Ok(CapabilityResponse::NoPlanNeeded);
    }
    Ok(CapabilityResponse::Plan(steps))
}

#[async_trait]
impl CapabilityPort for CommandPlanner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<CapabilityResponse, PortFailure> {
        let CapabilityRequest::Plan { name, description } = &invocation.request else {
            return Err(PortFailure::Unsupported {
                port: self.program.clone(),
                request: invocation.request.kind(),
            });
        };
        let prompt = self
            .render_prompt(&invocation.key, name, description)
            .map_err(|err| PortFailure::Rejected(format!("render planner prompt: {err:#}")))?;
        self.run(&invocation.key, prompt).await
    }
}
