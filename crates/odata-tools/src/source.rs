//! MCP-facing tool source for one OData service.

use crate::cache::{CatalogCache, CatalogSnapshot, MetadataSource, metadata_source};
use crate::catalog::OperationDescriptor;
use crate::config::ServiceConfig;
use crate::error::{ExecutionError, ODataToolsError, Result};
use crate::runtime::{ODataExecutor, cancel_after};
use crate::safety::OutboundHttpSafety;
use crate::semantics::annotations_for_kind;
use rmcp::model::{CallToolResult, Content, JsonObject, Tool};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// OData tool source that exposes a service's entity sets as MCP tools.
#[derive(Clone)]
pub struct ODataToolSource {
    /// Source name / id (cache key, logs).
    name: String,
    config: ServiceConfig,
    cache: CatalogCache,
    executor: ODataExecutor,
    /// Call timeout used when the service config doesn't specify one.
    default_timeout: Duration,
    /// Bound on the initial metadata load.
    startup_timeout: Duration,
}

impl ODataToolSource {
    /// Create a new tool source with a permissive outbound policy.
    ///
    /// Nothing is fetched here; call [`Self::start`] (or use [`Self::build`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the HTTP client cannot be built.
    pub fn new(
        name: String,
        config: ServiceConfig,
        default_timeout: Duration,
        startup_timeout: Duration,
    ) -> Result<Self> {
        Self::new_with_safety(
            name,
            config,
            default_timeout,
            startup_timeout,
            OutboundHttpSafety::permissive(),
        )
    }

    /// Create a new tool source with an explicit outbound safety policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the HTTP client cannot be built.
    pub fn new_with_safety(
        name: String,
        config: ServiceConfig,
        default_timeout: Duration,
        startup_timeout: Duration,
        safety: OutboundHttpSafety,
    ) -> Result<Self> {
        config.validate()?;
        let source = metadata_source(&config, Some(startup_timeout), safety.clone())?;
        Self::with_metadata_source(name, config, source, default_timeout, startup_timeout, safety)
    }

    /// Create a tool source reading metadata from a caller-supplied source.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_metadata_source(
        name: String,
        config: ServiceConfig,
        source: Arc<dyn MetadataSource>,
        default_timeout: Duration,
        startup_timeout: Duration,
        safety: OutboundHttpSafety,
    ) -> Result<Self> {
        let executor = ODataExecutor::new(&config, safety)?;
        let cache = CatalogCache::new();
        cache.register(
            name.clone(),
            source,
            config.profile.clone(),
            Duration::from_secs(config.refresh_interval_secs),
        );
        Ok(Self {
            name,
            config,
            cache,
            executor,
            default_timeout,
            startup_timeout,
        })
    }

    /// Create and start a tool source in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata loading, parsing or catalog synthesis fails.
    pub async fn build(
        name: String,
        config: ServiceConfig,
        default_timeout: Duration,
        startup_timeout: Duration,
    ) -> Result<Self> {
        let src = Self::new(name, config, default_timeout, startup_timeout)?;
        src.start().await?;
        Ok(src)
    }

    /// Create and start a tool source in one step with an explicit outbound safety policy.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata loading, parsing or catalog synthesis fails.
    pub async fn build_with_safety(
        name: String,
        config: ServiceConfig,
        default_timeout: Duration,
        startup_timeout: Duration,
        safety: OutboundHttpSafety,
    ) -> Result<Self> {
        let src = Self::new_with_safety(name, config, default_timeout, startup_timeout, safety)?;
        src.start().await?;
        Ok(src)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Load the initial catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be built within the startup timeout.
    pub async fn start(&self) -> Result<()> {
        let startup_timeout = self.startup_timeout;
        let snapshot =
            match tokio::time::timeout(startup_timeout, self.cache.get_catalog(&self.name)).await {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(ODataToolsError::Startup(format!(
                        "Startup timeout after {}s for OData tool source '{}'",
                        startup_timeout.as_secs(),
                        self.name
                    )));
                }
            };

        tracing::info!(
            "Discovered {} tools from OData service '{}'",
            snapshot.operations.len(),
            self.name
        );
        Ok(())
    }

    /// Refresh metadata every `refreshIntervalSecs` until `cancel` fires.
    ///
    /// Returns `None` when periodic refresh is disabled (interval 0).
    #[must_use]
    pub fn spawn_refresh(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.refresh_interval_secs == 0 {
            return None;
        }
        Some(self.cache.start_refresh_task(
            self.name.clone(),
            Duration::from_secs(self.config.refresh_interval_secs),
            cancel,
        ))
    }

    /// Stop every background catalog refresh, including fetches in flight.
    pub fn shutdown(&self) {
        self.cache.shutdown();
    }

    /// The current catalog, refreshing in the background once it is older than the TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if no catalog has been loaded yet and loading fails.
    pub async fn catalog(&self) -> Result<Arc<CatalogSnapshot>> {
        self.cache.get_catalog(&self.name).await
    }

    /// List the MCP `Tool`s exposed by this source.
    ///
    /// # Errors
    ///
    /// Returns an error if no catalog could be loaded.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let snapshot = self.catalog().await?;
        Ok(snapshot.operations.iter().map(tool_for).collect())
    }

    /// Execute a tool call.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool name is unknown or no catalog could be loaded. Invocation
    /// failures are reported inside the result with `is_error` set.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.call_tool_with_cancel(name, arguments, &CancellationToken::new())
            .await
    }

    /// Execute a tool call that aborts when `cancel` fires.
    ///
    /// # Errors
    ///
    /// See [`Self::call_tool`].
    pub async fn call_tool_with_cancel(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult> {
        let snapshot = self.catalog().await?;
        let op = snapshot
            .operation(name)
            .ok_or_else(|| ExecutionError::UnknownOperation(name.to_string()))?;

        let token = match self.call_timeout() {
            Some(timeout) => cancel_after(cancel, timeout),
            None => cancel.child_token(),
        };
        let _guard = token.clone().drop_guard();

        let outcome = self
            .executor
            .execute(op, &arguments, self.config.base_url.as_deref(), &token)
            .await;

        match outcome {
            Ok(body) => {
                let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => {
                tracing::warn!(
                    source = %self.name,
                    tool = %name,
                    kind = e.kind(),
                    error = %e,
                    "tool call failed"
                );
                let structured = json!({ "error": e.to_value() });
                Ok(CallToolResult {
                    content: vec![Content::text(e.to_string())],
                    structured_content: Some(structured),
                    is_error: Some(true),
                    meta: None,
                })
            }
        }
    }

    fn call_timeout(&self) -> Option<Duration> {
        match self.config.timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(self.default_timeout),
        }
    }
}

/// Render one descriptor as an MCP tool.
#[must_use]
pub fn tool_for(op: &OperationDescriptor) -> Tool {
    let schema_obj = op
        .input_schema
        .as_object()
        .cloned()
        .unwrap_or_else(JsonObject::new);
    let mut tool = Tool::new(op.name.clone(), op.description.clone(), Arc::new(schema_obj));
    tool.annotations = Some(annotations_for_kind(op.kind));
    tool
}
