use async_trait::async_trait;
use serde_json::json;

use crate::generation::ToolDefinition;
use crate::tools::{require_str, Tool, ToolError, ToolGateway, ToolKind};

/// Results kept per query when rendering prompt context.
const DEFAULT_CONTEXT_RESULTS: usize = 3;

pub struct WebSearchTool {
    context_results: usize,
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self {
            context_results: DEFAULT_CONTEXT_RESULTS,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: ToolKind::Search.to_string(),
            description: "Search the web. Returns titles, snippets and links of the top results. Use this to ground claims about competitors, audiences and market trends.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    fn argument(&self, input: &serde_json::Value) -> Result<String, ToolError> {
        require_str(input, "query").map(str::to_string)
    }

    async fn run(&self, gateway: &dyn ToolGateway, query: &str) -> Result<String, ToolError> {
        let results = gateway.search(query).await?;

        if results.is_empty() {
            return Ok(format!("No results found for: {query}"));
        }

        let mut formatted = format!("=== Search: {query} ===\n");
        for (i, result) in results.iter().take(self.context_results).enumerate() {
            formatted.push_str(&format!(
                "\n{}. {}\n   {}\n   {}\n",
                i + 1,
                result.title,
                result.snippet,
                result.link
            ));
        }
        Ok(formatted)
    }
}
