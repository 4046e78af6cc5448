//! Capability ports: the narrow seam between the wake cycle and external
//! providers.
//!
//! Every provider implements [`CapabilityPort`]. The cycle owns timeouts, panic
//! isolation and retry bookkeeping, so ports only translate a request into a
//! response or a [`PortFailure`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::{MarketplaceSummary, Task, TaskAction};

/// Why a port could not complete a request. Always a task-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortFailure {
    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unknown tool '{tool}' on server '{server}'")]
    UnknownTool { server: String, tool: String },
    #[error("port '{port}' does not support {request}")]
    Unsupported { port: String, request: &'static str },
    #[error("no {kind} port configured for '{name}'")]
    NotConfigured { kind: &'static str, name: String },
    #[error("port panicked: {0}")]
    Panicked(String),
}

/// One ordered planning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub order: u32,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityRequest {
    Plan {
        name: String,
        description: String,
    },
    InvokeTool {
        tool: String,
        arguments: Value,
    },
    FetchSummary,
    MarketplaceOperation {
        operation: String,
        job_id: String,
        payload: Value,
    },
    ProposeChange {
        description: String,
        diff: String,
    },
}

impl CapabilityRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityRequest::Plan { .. } => "plan",
            CapabilityRequest::InvokeTool { .. } => "invoke_tool",
            CapabilityRequest::FetchSummary => "fetch_summary",
            CapabilityRequest::MarketplaceOperation { .. } => "marketplace_operation",
            CapabilityRequest::ProposeChange { .. } => "propose_change",
        }
    }
}

/// A request addressed with an idempotency key.
///
/// The key is `<task_id>:<attempt>`; an uncommitted cycle does not advance
/// `attempt_count`, so a replayed attempt reuses its key.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub key: String,
    pub request: CapabilityRequest,
}

impl Invocation {
    pub fn for_task(task: &Task, request: CapabilityRequest) -> Self {
        Self {
            key: format!("{}:{}", task.id, task.attempt_count + 1),
            request,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityResponse {
    Plan(Vec<PlanStep>),
    /// The planner decided the task needs no plan. Not a failure.
    NoPlanNeeded,
    ToolResult(Value),
    Summary(MarketplaceSummary),
    Accepted { reference: String },
    Proposal { proposal_id: String },
}

impl CapabilityResponse {
    /// Short text stored as the task result.
    pub fn summary(&self) -> String {
        match self {
            CapabilityResponse::Plan(steps) => format!("planned {} step(s)", steps.len()),
            CapabilityResponse::NoPlanNeeded => "no plan needed".to_string(),
            CapabilityResponse::ToolResult(value) => truncate(&value.to_string(), 200),
            CapabilityResponse::Summary(summary) => format!(
                "earned ${:.2}, pending ${:.2}, {} job(s) completed",
                summary.earned_usd, summary.pending_usd, summary.jobs_completed
            ),
            CapabilityResponse::Accepted { reference } => format!("accepted as {reference}"),
            CapabilityResponse::Proposal { proposal_id } => format!("proposal {proposal_id}"),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// An external provider reachable through `invoke`.
#[async_trait]
pub trait CapabilityPort: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, invocation: &Invocation) -> Result<CapabilityResponse, PortFailure>;
}

/// A registered port, as listed in the status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub kind: &'static str,
    pub name: String,
}

/// The set of ports available to a cycle.
#[derive(Default, Clone)]
pub struct PortRegistry {
    planner: Option<Arc<dyn CapabilityPort>>,
    tool_servers: BTreeMap<String, Arc<dyn CapabilityPort>>,
    marketplaces: BTreeMap<String, Arc<dyn CapabilityPort>>,
    code_host: Option<Arc<dyn CapabilityPort>>,
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.capabilities()).finish()
    }
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_planner(mut self, port: Arc<dyn CapabilityPort>) -> Self {
        self.planner = Some(port);
        self
    }

    pub fn with_tool_server(mut self, port: Arc<dyn CapabilityPort>) -> Self {
        self.tool_servers.insert(port.name().to_string(), port);
        self
    }

    pub fn with_marketplace(mut self, port: Arc<dyn CapabilityPort>) -> Self {
        self.marketplaces.insert(port.name().to_string(), port);
        self
    }

    pub fn with_code_host(mut self, port: Arc<dyn CapabilityPort>) -> Self {
        self.code_host = Some(port);
        self
    }

    /// Map a task's action to the port it runs on and the request to send.
    pub fn resolve(
        &self,
        task: &Task,
    ) -> Result<(Arc<dyn CapabilityPort>, CapabilityRequest), PortFailure> {
        match &task.action {
            TaskAction::Plan => {
                let port = self.planner.clone().ok_or(PortFailure::NotConfigured {
                    kind: "planner",
                    name: task.name.clone(),
                })?;
                Ok((
                    port,
                    CapabilityRequest::Plan {
                        name: task.name.clone(),
                        description: task.description.clone(),
                    },
                ))
            }
            TaskAction::Tool {
                server,
                tool,
                arguments,
            } => {
                let port = lookup(&self.tool_servers, "tool server", server)?;
                Ok((
                    port,
                    CapabilityRequest::InvokeTool {
                        tool: tool.clone(),
                        arguments: arguments.clone(),
                    },
                ))
            }
            TaskAction::MarketplaceSync { marketplace } => {
                let port = lookup(&self.marketplaces, "marketplace", marketplace)?;
                Ok((port, CapabilityRequest::FetchSummary))
            }
            TaskAction::MarketplaceJob {
                marketplace,
                operation,
                job_id,
                payload,
            } => {
                let port = lookup(&self.marketplaces, "marketplace", marketplace)?;
                Ok((
                    port,
                    CapabilityRequest::MarketplaceOperation {
                        operation: operation.clone(),
                        job_id: job_id.clone(),
                        payload: payload.clone(),
                    },
                ))
            }
            TaskAction::ProposeChange { diff } => {
                let port = self.code_host.clone().ok_or(PortFailure::NotConfigured {
                    kind: "code host",
                    name: task.name.clone(),
                })?;
                let description = if task.description.trim().is_empty() {
                    task.name.clone()
                } else {
                    task.description.clone()
                };
                Ok((
                    port,
                    CapabilityRequest::ProposeChange {
                        description,
                        diff: diff.clone(),
                    },
                ))
            }
        }
    }

    /// Registered ports, planner first.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut out = Vec::new();
        if let Some(port) = &self.planner {
            out.push(Capability {
                kind: "planner",
                name: port.name().to_string(),
            });
        }
        for name in self.tool_servers.keys() {
            out.push(Capability {
                kind: "tool_server",
                name: name.clone(),
            });
        }
        for name in self.marketplaces.keys() {
            out.push(Capability {
                kind: "marketplace",
                name: name.clone(),
            });
        }
        if let Some(port) = &self.code_host {
            out.push(Capability {
                kind: "code_host",
                name: port.name().to_string(),
            });
        }
        out
    }
}

fn lookup(
    ports: &BTreeMap<String, Arc<dyn CapabilityPort>>,
    kind: &'static str,
    name: &str,
) -> Result<Arc<dyn CapabilityPort>, PortFailure> {
    ports
        .get(name)
        .cloned()
        .ok_or_else(|| PortFailure::NotConfigured {
            kind,
            name: name.to_string(),
        })
}
