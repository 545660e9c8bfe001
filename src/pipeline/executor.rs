//! The stage execution protocol: render, prefetch tools, generate, validate.

use thiserror::Error;

use crate::generation::{GenerationClient, GenerationError, GenerationRequest};
use crate::pipeline::results::StructuredResult;
use crate::pipeline::schema::{parse_json_output, ValidationError};
use crate::pipeline::stage::{render, RenderContext, RenderError, StageSpec};
use crate::pipeline::state::{StageErrorKind, WorkflowState};
use crate::tools::{PrefetchResult, ToolSet};

/// Why a single pass of the protocol failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageFailure {
    #[error("prompt render failed: {0}")]
    Render(#[from] RenderError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl StageFailure {
    pub fn kind(&self) -> StageErrorKind {
        match self {
            StageFailure::Render(_) => StageErrorKind::PromptRenderError,
            StageFailure::Generation(_) => StageErrorKind::GenerationFailed,
            StageFailure::Validation(_) => StageErrorKind::ValidationFailed,
        }
    }

    /// Render failures are invariant violations and end the stage at once.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageFailure::Render(_) => false,
            StageFailure::Generation(e) => e.is_retryable(),
            StageFailure::Validation(_) => true,
        }
    }

    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            StageFailure::Generation(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Runs one stage against one generation client.
pub struct StageExecutor<'a> {
    generation: &'a dyn GenerationClient,
}

impl<'a> StageExecutor<'a> {
    pub fn new(generation: &'a dyn GenerationClient) -> Self {
        Self { generation }
    }

    /// Render the prompt and append the context gathered by the stage's
    /// planned tool calls. Done once per stage, before the first attempt.
    pub async fn prepare(
        &self,
        spec: &StageSpec,
        state: &WorkflowState,
        tools: &ToolSet<'_>,
    ) -> Result<String, StageFailure> {
        let context = RenderContext::from_state(state, &spec.depends_on);
        let prompt = render(&spec.prompt_template, &context)?;

        if tools.is_empty() || spec.planned_calls.is_empty() {
            return Ok(prompt);
        }

        let requests = spec
            .planned_calls
            .iter()
            .map(|call| Ok((call.tool, render(&call.argument, &context)?)))
            .collect::<Result<Vec<_>, RenderError>>()?;

        let results = tools.prefetch(&requests).await;
        Ok(append_tool_context(prompt, &results))
    }

    /// One generation attempt. `hint` carries the previous validation error
    /// so the model can correct its output.
    pub async fn attempt(
        &self,
        spec: &StageSpec,
        prompt: &str,
        tools: &ToolSet<'_>,
        hint: Option<&str>,
    ) -> Result<StructuredResult, StageFailure> {
        let prompt = match hint {
            Some(hint) => format!(
                "{prompt}\n\nYour previous answer was rejected: {hint}\n\
                 Return a corrected JSON object that matches the schema."
            ),
            None => prompt.to_string(),
        };

        let request = GenerationRequest {
            stage: spec.id,
            system: &spec.system_prompt,
            prompt,
            schema: &spec.output_schema,
        };

        let raw = self.generation.generate(&request, tools).await?;
        tracing::debug!(
            stage = %spec.id,
            input_tokens = raw.input_tokens,
            output_tokens = raw.output_tokens,
            "Generation returned"
        );

        let parsed = parse_json_output(&raw.text)?;
        let validated = spec.output_schema.validate(&parsed)?;
        StructuredResult::from_validated(spec.id, validated)
            .map_err(|e| StageFailure::Validation(ValidationError::Conversion(e.to_string())))
    }

    /// Single pass of the protocol without retries.
    pub async fn execute(
        &self,
        spec: &StageSpec,
        state: &WorkflowState,
        tools: &ToolSet<'_>,
    ) -> Result<StructuredResult, StageFailure> {
        let prompt = self.prepare(spec, state, tools).await?;
        self.attempt(spec, &prompt, tools, None).await
    }
}

/// Successful tool results become supplementary prompt context, in request
/// order. Failed calls are left out.
fn append_tool_context(prompt: String, results: &[PrefetchResult]) -> String {
    let sections: Vec<&str> = results
        .iter()
        .filter_map(|r| r.result.as_deref().ok())
        .collect();

    if sections.is_empty() {
        return prompt;
    }

    format!(
        "{prompt}\n\nSupplementary context from web research:\n\n{}",
        sections.join("\n\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::{market_research, strategy_planning, trend_analysis};
    use crate::pipeline::state::StageId;
    use crate::testing::{canned_output, sample_input, RecordingGateway, ScriptedGeneration};
    use crate::tools::{ToolError, ToolKind};
    use std::time::Duration;

    fn tools_for<'a>(gateway: &'a RecordingGateway, spec: &StageSpec) -> ToolSet<'a> {
        ToolSet::new(Some(gateway), &spec.allowed_tools, Duration::from_secs(10), 4)
    }

    #[tokio::test]
    async fn test_execute_validates_and_types_output() {
        let generation = ScriptedGeneration::new();
        let state = WorkflowState::new(sample_input());
        let spec = trend_analysis();

        let result = StageExecutor::new(&generation)
            .execute(&spec, &state, &ToolSet::disabled())
            .await
            .unwrap();
        assert_eq!(result.stage(), StageId::TrendAnalysis);
    }

    #[tokio::test]
    async fn test_prepare_runs_tool_plan_and_appends_context() {
        let generation = ScriptedGeneration::new();
        let gateway = RecordingGateway::new();
        let state = WorkflowState::new(sample_input());
        let spec = market_research();
        let tools = tools_for(&gateway, &spec);

        let prompt = StageExecutor::new(&generation)
            .prepare(&spec, &state, &tools)
            .await
            .unwrap();

        assert!(prompt.contains("Supplementary context from web research"));
        assert!(prompt.contains("=== Page: acme.io ==="));
        let calls = gateway.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], (ToolKind::Search, "SaaS companies competitors of acme.io".to_string()));
        assert_eq!(calls[2], (ToolKind::Fetch, "acme.io".to_string()));
    }

    #[tokio::test]
    async fn test_tool_failure_degrades_to_generation_only() {
        let generation = ScriptedGeneration::new();
        let gateway = RecordingGateway::new()
            .failing("SaaS market trends", ToolError::Timeout(Duration::from_secs(10)));
        let state = WorkflowState::new(sample_input());
        let spec = trend_analysis();
        let tools = tools_for(&gateway, &spec);

        let result = StageExecutor::new(&generation).execute(&spec, &state, &tools).await;
        assert!(result.is_ok());

        let log = tools.take_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_failure());
        let prompt = generation.prompts(StageId::TrendAnalysis).remove(0);
        assert!(!prompt.contains("Supplementary context"));
    }

    #[tokio::test]
    async fn test_missing_dependency_is_render_error() {
        let generation = ScriptedGeneration::new();
        let state = WorkflowState::new(sample_input());

        let err = StageExecutor::new(&generation)
            .execute(&strategy_planning(), &state, &ToolSet::disabled())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StageErrorKind::PromptRenderError);
        assert!(!err.is_retryable());
        assert_eq!(generation.calls(StageId::StrategyPlanning), 0);
    }

    #[tokio::test]
    async fn test_malformed_output_is_validation_failure() {
        let generation = ScriptedGeneration::new().reply(StageId::TrendAnalysis, Ok("not json".into()));
        let state = WorkflowState::new(sample_input());

        let err = StageExecutor::new(&generation)
            .execute(&trend_analysis(), &state, &ToolSet::disabled())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StageErrorKind::ValidationFailed);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fenced_output_is_accepted() {
        let fenced = format!("```json\n{}\n```", canned_output(StageId::TrendAnalysis));
        let generation = ScriptedGeneration::new().reply(StageId::TrendAnalysis, Ok(fenced));
        let state = WorkflowState::new(sample_input());

        let result = StageExecutor::new(&generation)
            .execute(&trend_analysis(), &state, &ToolSet::disabled())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_hint_is_added_to_prompt() {
        let generation = ScriptedGeneration::new();
        let spec = trend_analysis();
        StageExecutor::new(&generation)
            .attempt(&spec, "base prompt", &ToolSet::disabled(), Some("$.tech_trends: required field is missing"))
            .await
            .unwrap();

        let prompt = generation.prompts(StageId::TrendAnalysis).remove(0);
        assert!(prompt.starts_with("base prompt"));
        assert!(prompt.contains("rejected: $.tech_trends: required field is missing"));
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let failure = StageFailure::Generation(GenerationError::Api {
            status: 401,
            message: "invalid x-api-key".into(),
        });
        assert!(!failure.is_retryable());
        assert!(StageFailure::Generation(GenerationError::Timeout).is_retryable());
    }
}
