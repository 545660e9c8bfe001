use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::error::{AppError, Result};
use crate::generation::{
    GenerationClient, GenerationError, GenerationRequest, RawOutput, ToolDefinition,
};
use crate::tools::{ToolOutput, ToolSet};

const API_VERSION: &str = "2023-06-01";

/// Upper bound on a server-supplied retry-after hint.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

pub struct ClaudeClient {
    client: Client,
    api_key: String,
    url: String,
    model: String,
    max_tokens: u32,
    max_turns: u32,
}

impl ClaudeClient {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            url: config.base_url.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_turns: config.max_turns.max(1),
        })
    }

    pub async fn send_message(
        &self,
        request: &MessagesRequest,
    ) -> std::result::Result<MessagesResponse, GenerationError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body, retry_after));
        }

        response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| GenerationError::UnexpectedResponse(e.to_string()))
    }
}

#[async_trait]
impl GenerationClient for ClaudeClient {
    /// Run the tool-use loop until the model produces a final answer.
    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
        tools: &ToolSet<'_>,
    ) -> std::result::Result<RawOutput, GenerationError> {
        let system = system_with_schema(request);
        let tool_definitions = tools.definitions();

        let mut messages = vec![Message {
            role: "user".to_string(),
            content: MessageContent::Text(request.prompt.clone()),
        }];

        let mut total_input_tokens = 0u32;
        let mut total_output_tokens = 0u32;

        for turn in 0..self.max_turns {
            let api_request = MessagesRequest {
                model: self.model.clone(),
                max_tokens: self.max_tokens,
                system: system.clone(),
                messages: messages.clone(),
                tools: tool_definitions.clone(),
            };

            let response = self.send_message(&api_request).await?;

            total_input_tokens += response.usage.input_tokens;
            total_output_tokens += response.usage.output_tokens;

            tracing::debug!(
                stage = %request.stage,
                turn,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                stop_reason = ?response.stop_reason,
                "Claude response"
            );

            match response.stop_reason.as_deref().unwrap_or("unknown") {
                "end_turn" | "stop_sequence" => {
                    return Ok(RawOutput {
                        text: extract_text(&response.content),
                        input_tokens: total_input_tokens,
                        output_tokens: total_output_tokens,
                    });
                }
                "tool_use" => {
                    messages.push(Message {
                        role: "assistant".to_string(),
                        content: MessageContent::Blocks(response.content.clone()),
                    });

                    let mut tool_results = Vec::new();
                    for block in &response.content {
                        if let ContentBlock::ToolUse { id, name, input } = block {
                            tracing::info!(stage = %request.stage, tool = %name, "Executing tool");
                            let (content, is_error) = match tools.invoke(name, input).await {
                                ToolOutput::Success(content) => (content, None),
                                ToolOutput::Error(error) => (error, Some(true)),
                            };
                            tool_results.push(ContentBlock::ToolResult {
                                tool_use_id: id.clone(),
                                content,
                                is_error,
                            });
                        }
                    }

                    messages.push(Message {
                        role: "user".to_string(),
                        content: MessageContent::Blocks(tool_results),
                    });
                }
                "max_tokens" => {
                    tracing::warn!(stage = %request.stage, "Response hit max_tokens limit");
                    messages.push(Message {
                        role: "assistant".to_string(),
                        content: MessageContent::Blocks(response.content),
                    });
                    messages.push(Message {
                        role: "user".to_string(),
                        content: MessageContent::Text(
                            "Your answer was cut off. Reply again with the complete JSON object only."
                                .to_string(),
                        ),
                    });
                }
                other => {
                    return Err(GenerationError::UnexpectedResponse(format!(
                        "unexpected stop reason: {other}"
                    )));
                }
            }
        }

        Err(GenerationError::TurnLimit(self.max_turns))
    }
}

fn system_with_schema(request: &GenerationRequest<'_>) -> String {
    format!(
        "{}\n\nReturn ONLY a JSON object, without Markdown formatting or extra text, \
         that conforms to this JSON Schema:\n{}",
        request.system,
        request.schema.to_json_schema()
    )
}

fn map_transport_error(e: reqwest::Error) -> GenerationError {
    if e.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Transport(e.to_string())
    }
}

fn map_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> GenerationError {
    match status.as_u16() {
        429 => GenerationError::RateLimited {
            message: body,
            retry_after,
        },
        408 | 504 => GenerationError::Timeout,
        500 | 502 | 503 | 529 => GenerationError::Unavailable(format!("{status}: {body}")),
        code => GenerationError::Api {
            status: code,
            message: body,
        },
    }
}

/// Parse a `retry-after` header given in seconds, clamped to [`MAX_RETRY_AFTER`].
fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(secs)
            .map_or(MAX_RETRY_AFTER, |hint| hint.min(MAX_RETRY_AFTER)),
    )
}

fn extract_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| {
            if let ContentBlock::Text { text } = block {
                Some(text.as_str())
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

// --- Response types ---

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::{FieldSpec, FieldType, Schema};
    use crate::pipeline::state::StageId;

    #[test]
    fn test_rate_limit_keeps_retry_after() {
        let err = map_status(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down".to_string(),
            parse_retry_after("7"),
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::from_u16(529).unwrap(), String::new(), None),
            GenerationError::Unavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "bad key".to_string(), None),
            GenerationError::Api { status: 401, .. }
        ));
        assert_eq!(
            map_status(StatusCode::GATEWAY_TIMEOUT, String::new(), None),
            GenerationError::Timeout
        );
    }

    #[test]
    fn test_parse_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("1.5"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-3"), None);
        assert_eq!(parse_retry_after("NaN"), None);
    }

    #[test]
    fn test_parse_retry_after_clamps_huge_hints() {
        assert_eq!(parse_retry_after("1e30"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("86400"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("inf"), None);
    }

    #[test]
    fn test_parse_tool_use_response() {
        let body = r#"{
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "Let me search."},
                {"type": "tool_use", "id": "tu_1", "name": "web_search", "input": {"query": "ai"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;
        let response: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
        assert!(matches!(
            &response.content[1],
            ContentBlock::ToolUse { name, .. } if name == "web_search"
        ));
        assert_eq!(extract_text(&response.content), "Let me search.");
    }

    #[test]
    fn test_system_prompt_carries_schema() {
        let schema = Schema::new("s", vec![FieldSpec::required("name", FieldType::String)]);
        let request = GenerationRequest {
            stage: StageId::StrategyPlanning,
            system: "You plan strategies.",
            prompt: String::new(),
            schema: &schema,
        };
        let system = system_with_schema(&request);
        assert!(system.starts_with("You plan strategies."));
        assert!(system.contains("\"required\":[\"name\"]"));
    }
}
