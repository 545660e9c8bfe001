use async_trait::async_trait;
use serde_json::json;

use crate::generation::ToolDefinition;
use crate::tools::{require_str, Tool, ToolError, ToolGateway, ToolKind};

pub struct FetchPageTool;

#[async_trait]
impl Tool for FetchPageTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Fetch
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: ToolKind::Fetch.to_string(),
            description: "Fetch a web page and return its readable text. Use this to read a company's own website.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "Absolute URL or bare domain of the page"
                    }
                },
                "required": ["url"]
            }),
        }
    }

    fn argument(&self, input: &serde_json::Value) -> Result<String, ToolError> {
        require_str(input, "url").map(str::to_string)
    }

    async fn run(&self, gateway: &dyn ToolGateway, url: &str) -> Result<String, ToolError> {
        let page = gateway.fetch(url).await?;

        let mut formatted = format!("=== Page: {} ===\n", page.url);
        if let Some(title) = &page.title {
            formatted.push_str(&format!("Title: {title}\n"));
        }
        formatted.push('\n');
        formatted.push_str(&page.text);
        Ok(formatted)
    }
}
