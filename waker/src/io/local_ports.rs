//! In-process capability ports used when no external provider is configured.
//!
//! These produce deterministic, simulated results so an agent can run end to
//! end on a laptop. None of them touches the network.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;

use crate::core::types::MarketplaceSummary;
use crate::io::ports::{
    CapabilityPort, CapabilityRequest, CapabilityResponse, Invocation, PlanStep, PortFailure,
};
use crate::io::tool_catalog::ToolServer;

/// Phases used when a description is a single instruction.
const DEFAULT_PHASES: [&str; 5] = [
    "Research and gather requirements",
    "Design the approach",
    "Implement core functionality",
    "Test and validate",
    "Deploy and document",
];

/// Splits a description into ordered steps without calling a model.
#[derive(Debug, Clone, Default)]
pub struct LocalPlanner;

impl LocalPlanner {
    pub fn plan(description: &str) -> CapabilityResponse {
        let fragments: Vec<&str> = description
            .split(['\n', ';', '.'])
            .map(|s| s.trim().trim_start_matches(['-', '*']).trim())
            .filter(|s| !s.is_empty())
            .collect();
        let steps: Vec<String> = match fragments.as_slice() {
            [] => return CapabilityResponse::NoPlanNeeded,
            [single] => DEFAULT_PHASES
                .iter()
                .map(|phase| format!("{phase}: {single}"))
                .collect(),
            many => many.iter().map(|s| s.to_string()).collect(),
        };
        CapabilityResponse::Plan(
            steps
                .into_iter()
                .zip(1u32..)
                .map(|(summary, order)| PlanStep { order, summary })
                .collect(),
        )
    }
}

#[async_trait]
impl CapabilityPort for LocalPlanner {
    fn name(&self) -> &str {
        "local"
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<CapabilityResponse, PortFailure> {
        match &invocation.request {
            CapabilityRequest::Plan { description, .. } => Ok(Self::plan(description)),
            other => Err(PortFailure::Unsupported {
                port: self.name().to_string(),
                request: other.kind(),
            }),
        }
    }
}

/// A tool server with a fixed catalog that returns simulated results.
#[derive(Debug, Clone)]
pub struct StaticToolServer {
    name: String,
    tools: Vec<String>,
}

impl StaticToolServer {
    pub fn new(name: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            name: name.into(),
            tools,
        }
    }
}

#[async_trait]
impl ToolServer for StaticToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<String>, PortFailure> {
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: &Value,
        idempotency_key: &str,
    ) -> Result<Value, PortFailure> {
        debug!(server = %self.name, tool, key = idempotency_key, "simulated tool call");
        Ok(json!({
            "success": true,
            "simulated": true,
            "server": self.name,
            "tool": tool,
            "arguments": arguments,
        }))
    }
}

/// Fixed earnings figures for one marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StaticEarnings {
    pub earned_usd: f64,
    pub pending_usd: f64,
    pub jobs_completed: u64,
}

/// A marketplace that reports configured earnings and acknowledges job
/// operations idempotently by job id.
#[derive(Debug)]
pub struct StaticMarketplace {
    name: String,
    earnings: StaticEarnings,
    accepted: Mutex<BTreeMap<String, String>>,
}

impl StaticMarketplace {
    pub fn new(name: impl Into<String>, earnings: StaticEarnings) -> Self {
        Self {
            name: name.into(),
            earnings,
            accepted: Mutex::new(BTreeMap::new()),
        }
    }

    /// Job ids acknowledged so far.
    pub fn accepted_jobs(&self) -> BTreeSet<String> {
        let accepted = self.accepted.lock().unwrap_or_else(|e| e.into_inner());
        accepted.keys().cloned().collect()
    }
}

#[async_trait]
impl CapabilityPort for StaticMarketplace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<CapabilityResponse, PortFailure> {
        match &invocation.request {
            CapabilityRequest::FetchSummary => Ok(CapabilityResponse::Summary(MarketplaceSummary {
                earned_usd: self.earnings.earned_usd,
                pending_usd: self.earnings.pending_usd,
                jobs_completed: self.earnings.jobs_completed,
                fetched_at: Utc::now(),
            })),
            CapabilityRequest::MarketplaceOperation {
                operation, job_id, ..
            } => {
                if operation.trim().is_empty() || job_id.trim().is_empty() {
                    return Err(PortFailure::Rejected(
                        "operation and job_id are required".to_string(),
                    ));
                }
                let mut accepted = self.accepted.lock().unwrap_or_else(|e| e.into_inner());
                let reference = accepted
                    .entry(job_id.clone())
                    .or_insert_with(|| format!("{}/{operation}/{job_id}", self.name))
                    .clone();
                Ok(CapabilityResponse::Accepted { reference })
            }
            other => Err(PortFailure::Unsupported {
                port: self.name.clone(),
                request: other.kind(),
            }),
        }
    }
}
