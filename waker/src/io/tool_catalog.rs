//! Tool server ports with a lazily fetched, process-lifetime tool catalog.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::io::ports::{CapabilityPort, CapabilityRequest, CapabilityResponse, Invocation, PortFailure};

/// A connected tool server (workflow engine, browser automation, ...).
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<String>, PortFailure>;

    async fn call_tool(
        &self,
        tool: &str,
        arguments: &Value,
        idempotency_key: &str,
    ) -> Result<Value, PortFailure>;
}

/// Adapts a [`ToolServer`] to the capability port interface.
///
/// The catalog is fetched on first use and cached for the lifetime of the
/// port. A failed fetch is not cached, so the next invocation tries again.
pub struct ToolPort<S> {
    server: S,
    catalog: OnceCell<BTreeSet<String>>,
}

impl<S: ToolServer> ToolPort<S> {
    pub fn new(server: S) -> Self {
        Self {
            server,
            catalog: OnceCell::new(),
        }
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    async fn catalog(&self) -> Result<&BTreeSet<String>, PortFailure> {
        self.catalog
            .get_or_try_init(|| async {
                let tools = self.server.list_tools().await.inspect_err(|err| {
                    warn!(server = self.server.name(), err = %err, "tool catalog fetch failed");
                })?;
                debug!(server = self.server.name(), tools = tools.len(), "tool catalog cached");
                Ok(tools.into_iter().collect())
            })
            .await
    }
}

#[async_trait]
impl<S: ToolServer> CapabilityPort for ToolPort<S> {
    fn name(&self) -> &str {
        self.server.name()
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<CapabilityResponse, PortFailure> {
        let CapabilityRequest::InvokeTool { tool, arguments } = &invocation.request else {
            return Err(PortFailure::Unsupported {
                port: self.server.name().to_string(),
                request: invocation.request.kind(),
            });
        };
        if !self.catalog().await?.contains(tool) {
            return Err(PortFailure::UnknownTool {
                server: self.server.name().to_string(),
                tool: tool.clone(),
            });
        }
        let value = self
            .server
            .call_tool(tool, arguments, &invocation.key)
            .await?;
        Ok(CapabilityResponse::ToolResult(value))
    }
}
