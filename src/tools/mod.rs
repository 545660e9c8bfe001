pub mod fetch;
pub mod search;
pub mod web;

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generation::ToolDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Timeout,
    NotFound,
    RateLimited,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("{0}")]
    Unknown(String),
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::Timeout(_) => ToolErrorKind::Timeout,
            ToolError::NotFound(_) => ToolErrorKind::NotFound,
            ToolError::RateLimited(_) => ToolErrorKind::RateLimited,
            ToolError::Unknown(_) => ToolErrorKind::Unknown,
        }
    }
}

/// Façade over the external search and page-retrieval capabilities.
///
/// Implementations do not retry. "No results" is an empty list, not an error.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ToolError>;

    async fn fetch(&self, url: &str) -> Result<PageContent, ToolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Search,
    Fetch,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Search => f.write_str("web_search"),
            ToolKind::Fetch => f.write_str("fetch_page"),
        }
    }
}

/// A gateway capability exposed to a stage, either for planned calls or to
/// the generation capability's own tool use.
#[async_trait]
pub trait Tool: Send + Sync {
    fn kind(&self) -> ToolKind;

    fn definition(&self) -> ToolDefinition;

    /// Extract the call argument (query or URL) from model-supplied input.
    fn argument(&self, input: &serde_json::Value) -> Result<String, ToolError>;

    /// Run the call and render its result as prompt context.
    async fn run(&self, gateway: &dyn ToolGateway, argument: &str) -> Result<String, ToolError>;
}

pub enum ToolOutput {
    /// Normal text result returned to the model.
    Success(String),
    /// Error result returned to the model (generation can continue without it).
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    /// Planned by the stage before generation.
    Prefetch,
    /// Requested by the generation capability.
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallStatus {
    Ok,
    Failed { kind: ToolErrorKind, message: String },
}

/// One entry of a stage's tool-call log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: ToolKind,
    pub origin: ToolOrigin,
    pub argument: String,
    pub status: ToolCallStatus,
    pub elapsed_ms: u64,
}

impl ToolCallRecord {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, ToolCallStatus::Failed { .. })
    }
}

/// Outcome of one planned call, kept in request order.
pub struct PrefetchResult {
    pub argument: String,
    pub result: Result<String, ToolError>,
}

/// The tools one stage may use, plus the log of every call made through them.
pub struct ToolSet<'a> {
    gateway: Option<&'a dyn ToolGateway>,
    tools: Vec<Box<dyn Tool>>,
    timeout: Duration,
    concurrency: usize,
    log: Mutex<Vec<ToolCallRecord>>,
}

impl<'a> ToolSet<'a> {
    /// Build the set for `allowed`. Without a gateway the set is empty and
    /// stages run on generation alone.
    pub fn new(
        gateway: Option<&'a dyn ToolGateway>,
        allowed: &[ToolKind],
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        let tools: Vec<Box<dyn Tool>> = match gateway {
            Some(_) => allowed
                .iter()
                .map(|kind| -> Box<dyn Tool> {
                    match kind {
                        ToolKind::Search => Box::new(search::WebSearchTool::default()),
                        ToolKind::Fetch => Box::new(fetch::FetchPageTool),
                    }
                })
                .collect(),
            None => Vec::new(),
        };

        Self {
            gateway,
            tools,
            timeout,
            concurrency: concurrency.max(1),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, &[], Duration::from_secs(10), 1)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    fn get(&self, kind: ToolKind) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.kind() == kind).map(|t| t.as_ref())
    }

    fn get_by_name(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.definition().name == name)
            .map(|t| t.as_ref())
    }

    /// Handle a tool call requested by the generation capability.
    pub async fn invoke(&self, name: &str, input: &serde_json::Value) -> ToolOutput {
        let Some(tool) = self.get_by_name(name) else {
            tracing::warn!(tool = %name, "Model requested a tool outside the stage allow-list");
            return ToolOutput::Error(format!("Unknown or disallowed tool: {name}"));
        };

        let argument = match tool.argument(input) {
            Ok(argument) => argument,
            Err(e) => return ToolOutput::Error(e.to_string()),
        };

        let (result, record) = self.call(tool, argument, ToolOrigin::Model).await;
        self.push_log(vec![record]);

        match result {
            Ok(content) => ToolOutput::Success(content),
            Err(e) => ToolOutput::Error(e.to_string()),
        }
    }

    /// Run planned calls concurrently, at most `concurrency` at a time.
    /// Results and log entries keep the order of `requests`. Calls for tools
    /// outside the allow-list are dropped.
    pub async fn prefetch(&self, requests: &[(ToolKind, String)]) -> Vec<PrefetchResult> {
        let allowed: Vec<(&dyn Tool, &String)> = requests
            .iter()
            .filter_map(|(kind, argument)| self.get(*kind).map(|tool| (tool, argument)))
            .collect();

        let outcomes: Vec<(PrefetchResult, ToolCallRecord)> = stream::iter(allowed)
            .map(|(tool, argument)| async move {
                let (result, record) = self.call(tool, argument.clone(), ToolOrigin::Prefetch).await;
                let prefetched = PrefetchResult {
                    argument: argument.clone(),
                    result,
                };
                (prefetched, record)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let (results, records): (Vec<_>, Vec<_>) = outcomes.into_iter().unzip();
        self.push_log(records);
        results
    }

    async fn call(
        &self,
        tool: &dyn Tool,
        argument: String,
        origin: ToolOrigin,
    ) -> (Result<String, ToolError>, ToolCallRecord) {
        let started = tokio::time::Instant::now();

        let result = match self.gateway {
            Some(gateway) => {
                match tokio::time::timeout(self.timeout, tool.run(gateway, &argument)).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout(self.timeout)),
                }
            }
            None => Err(ToolError::Unknown("no tool gateway configured".to_string())),
        };

        let status = match &result {
            Ok(_) => {
                tracing::debug!(tool = %tool.kind(), argument = %argument, "Tool succeeded");
                ToolCallStatus::Ok
            }
            Err(e) => {
                tracing::warn!(tool = %tool.kind(), argument = %argument, error = %e, "Tool error");
                ToolCallStatus::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };

        let record = ToolCallRecord {
            tool: tool.kind(),
            origin,
            argument,
            status,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        (result, record)
    }

    fn push_log(&self, records: Vec<ToolCallRecord>) {
        match self.log.lock() {
            Ok(mut log) => log.extend(records),
            Err(poisoned) => poisoned.into_inner().extend(records),
        }
    }

    /// Drain the tool-call log.
    pub fn take_log(&self) -> Vec<ToolCallRecord> {
        match self.log.lock() {
            Ok(mut log) => std::mem::take(&mut *log),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Pull a required string parameter out of model-supplied tool input.
pub(crate) fn require_str<'v>(input: &'v serde_json::Value, key: &str) -> Result<&'v str, ToolError> {
    input[key]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::Unknown(format!("Missing required parameter: {key}")))
}
