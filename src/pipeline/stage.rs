//! Stage descriptors and prompt rendering.
//!
//! A [`StageSpec`] is static data: prompt template, output schema, tool
//! allow-list, planned tool calls and declared dependencies. The orchestrator
//! owns an ordered list of them, so pipelines can be reordered or replaced in
//! tests without touching orchestration logic.

use std::collections::HashMap;

use thiserror::Error;

use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::schema::{FieldSpec, FieldType, Schema};
use crate::pipeline::state::{StageId, StateField, WorkflowState};
use crate::tools::ToolKind;

const PROJECT_BRIEF_CHARS: usize = 100;

/// A tool call a stage makes before generation. `argument` is a template.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedToolCall {
    pub tool: ToolKind,
    pub argument: String,
}

impl PlannedToolCall {
    pub fn search(query: &str) -> Self {
        Self {
            tool: ToolKind::Search,
            argument: query.to_string(),
        }
    }

    pub fn fetch(url: &str) -> Self {
        Self {
            tool: ToolKind::Fetch,
            argument: url.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: StageId,
    pub system_prompt: String,
    /// User prompt with `{{placeholder}}` slots filled from the state.
    pub prompt_template: String,
    pub output_schema: Schema,
    pub allowed_tools: Vec<ToolKind>,
    pub planned_calls: Vec<PlannedToolCall>,
    pub depends_on: Vec<StateField>,
    /// Overrides the orchestrator's retry policy for this stage.
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("placeholder '{{{{{0}}}}}' has no value in the current state")]
    MissingValue(String),

    #[error("unterminated placeholder in template")]
    Unterminated,
}

/// Values available to prompt templates for one stage.
pub struct RenderContext {
    values: HashMap<&'static str, String>,
}

impl RenderContext {
    /// Build the context from `state`. Fields listed in `depends_on` are only
    /// present when populated; other stage fields fall back to a placeholder.
    pub fn from_state(state: &WorkflowState, depends_on: &[StateField]) -> Self {
        let input = state.input();
        let mut values = HashMap::new();

        values.insert("company_domain", input.company_domain.clone());
        values.insert("industry", input.industry.clone());
        values.insert("project_description", input.project_description.clone());
        values.insert(
            "project_brief",
            input
                .project_description
                .chars()
                .take(PROJECT_BRIEF_CHARS)
                .collect::<String>(),
        );
        values.insert(
            "target_market",
            input
                .target_market
                .clone()
                .unwrap_or_else(|| "Not specified".to_string()),
        );
        values.insert(
            "goals",
            input.goals.clone().unwrap_or_else(|| "Not specified".to_string()),
        );

        let derived = [
            (
                "market_research",
                StateField::ResearchFindings,
                state.research_findings().map(|r| r.summary()),
                "No market research available",
            ),
            (
                "target_audience",
                StateField::ResearchFindings,
                state.research_findings().map(|r| r.audience_summary()),
                "No audience information available",
            ),
            (
                "trend_analysis",
                StateField::TrendFindings,
                state.trend_findings().map(|t| t.summary()),
                "No trend analysis available",
            ),
            (
                "marketing_strategy",
                StateField::Strategy,
                state.strategy().map(|s| s.summary()),
                "No marketing strategy available",
            ),
            (
                "campaign_content",
                StateField::Content,
                state.content().map(|c| c.summary()),
                "No campaign content available",
            ),
        ];

        for (key, field, value, fallback) in derived {
            match value {
                Some(value) => {
                    values.insert(key, value);
                }
                None if depends_on.contains(&field) => {}
                None => {
                    values.insert(key, fallback.to_string());
                }
            }
        }

        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Fill every `{{key}}` in `template` from `context`.
pub fn render(template: &str, context: &RenderContext) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(RenderError::Unterminated)?;
        let key = after[..end].trim();
        let value = context
            .get(key)
            .ok_or_else(|| RenderError::MissingValue(key.to_string()))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

/// The fixed marketing pipeline, in execution order.
pub fn default_stages() -> Vec<StageSpec> {
    vec![
        market_research(),
        trend_analysis(),
        strategy_planning(),
        content_creation(),
    ]
}

fn string_list() -> FieldType {
    FieldType::list_of(FieldType::String)
}

pub fn market_research() -> StageSpec {
    StageSpec {
        id: StageId::MarketResearch,
        system_prompt: "You are a lead market analyst. Analyze the company, its competitors and \
            its target audience, grounding your answer in the supplied search results and \
            website content. customer_profile should include company_name, industry, \
            products_services and market_position. Each competitor should include name, \
            strengths, weaknesses and differentiation. target_audience should include \
            demographics, preferences, pain_points and behavior."
            .to_string(),
        prompt_template: "Company Domain: {{company_domain}}\n\
            Industry: {{industry}}\n\
            Project Description: {{project_description}}\n\
            Target Market: {{target_market}}\n\
            Goals: {{goals}}\n\n\
            Provide a comprehensive market research analysis."
            .to_string(),
        output_schema: Schema::new(
            "market_research",
            vec![
                FieldSpec::required("customer_profile", FieldType::StringMap),
                FieldSpec::required(
                    "competitors",
                    FieldType::bounded_list(FieldType::StringMap, 1, 10),
                ),
                FieldSpec::required("target_audience", FieldType::StringMap),
                FieldSpec::required("market_positioning", FieldType::String),
            ],
        ),
        allowed_tools: vec![ToolKind::Search, ToolKind::Fetch],
        planned_calls: vec![
            PlannedToolCall::search("{{industry}} companies competitors of {{company_domain}}"),
            PlannedToolCall::search("{{industry}} {{project_brief}} target audience demographics"),
            PlannedToolCall::fetch("{{company_domain}}"),
        ],
        depends_on: Vec::new(),
        retry: None,
    }
}

pub fn trend_analysis() -> StageSpec {
    StageSpec {
        id: StageId::TrendAnalysis,
        system_prompt: "You are a trend analysis expert. Identify current market, technology and \
            consumer trends for the industry, assess their impact on the company and list the \
            opportunities they open up."
            .to_string(),
        prompt_template: "Industry: {{industry}}\n\
            Company Domain: {{company_domain}}\n\n\
            Market Research Results:\n{{market_research}}\n\n\
            Provide a comprehensive trend analysis and identify opportunities."
            .to_string(),
        output_schema: Schema::new(
            "trend_analysis",
            vec![
                FieldSpec::required("market_trends", string_list()),
                FieldSpec::required("tech_trends", string_list()),
                FieldSpec::required("consumer_trends", string_list()),
                FieldSpec::required("trend_impact", FieldType::String),
                FieldSpec::required("opportunities", string_list()),
            ],
        ),
        allowed_tools: vec![ToolKind::Search],
        planned_calls: vec![PlannedToolCall::search("{{industry}} market trends")],
        depends_on: Vec::new(),
        retry: None,
    }
}

pub fn strategy_planning() -> StageSpec {
    StageSpec {
        id: StageId::StrategyPlanning,
        system_prompt: "You are a chief marketing strategist. Build a marketing strategy with \
            specific, measurable goals, concrete tactics, the channels to use and the KPIs that \
            track progress."
            .to_string(),
        prompt_template: "Project Description: {{project_description}}\n\
            Target Market: {{target_market}}\n\
            Goals: {{goals}}\n\n\
            Market Research:\n{{market_research}}\n\n\
            Trend Analysis:\n{{trend_analysis}}\n\n\
            Create a comprehensive marketing strategy."
            .to_string(),
        output_schema: Schema::new(
            "marketing_strategy",
            vec![
                FieldSpec::required("name", FieldType::String),
                FieldSpec::required("goals", string_list()),
                FieldSpec::required("tactics", string_list()),
                FieldSpec::required("channels", string_list()),
                FieldSpec::required("kpis", string_list()).with_aliases(&["KPIs"]),
                FieldSpec::optional("priority", FieldType::Enum(&["low", "medium", "high"])),
            ],
        ),
        allowed_tools: Vec::new(),
        planned_calls: Vec::new(),
        depends_on: vec![StateField::ResearchFindings],
        retry: None,
    }
}

pub fn content_creation() -> StageSpec {
    StageSpec {
        id: StageId::ContentCreation,
        system_prompt: "You are a creative content creator. Create up to five campaign ideas \
            aligned with the strategy, each with a target audience and a primary channel, and \
            one persuasive marketing copy per idea, in the same order."
            .to_string(),
        prompt_template: "Project Description: {{project_description}}\n\n\
            Marketing Strategy:\n{{marketing_strategy}}\n\n\
            Target Audience:\n{{target_audience}}\n\n\
            Create innovative campaign ideas and compelling marketing copies."
            .to_string(),
        output_schema: Schema::new(
            "campaign_content",
            vec![
                FieldSpec::required(
                    "campaign_ideas",
                    FieldType::bounded_list(
                        FieldType::Object(vec![
                            FieldSpec::required("name", FieldType::String),
                            FieldSpec::required("description", FieldType::String),
                            FieldSpec::required("audience", FieldType::String),
                            FieldSpec::required("channel", FieldType::String),
                        ]),
                        1,
                        5,
                    ),
                ),
                FieldSpec::required(
                    "copies",
                    FieldType::bounded_list(
                        FieldType::Object(vec![
                            FieldSpec::required("title", FieldType::String),
                            FieldSpec::required("body", FieldType::String),
                        ]),
                        1,
                        5,
                    ),
                ),
            ],
        ),
        allowed_tools: Vec::new(),
        planned_calls: Vec::new(),
        depends_on: vec![StateField::Strategy],
        retry: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_input, sample_result};

    #[test]
    fn test_default_pipeline_order_and_dependencies() {
        let stages = default_stages();
        let ids: Vec<_> = stages.iter().map(|s| s.id).collect();
        assert_eq!(ids, StageId::ALL.to_vec());

        assert!(stages[0].depends_on.is_empty());
        assert!(stages[1].depends_on.is_empty());
        assert_eq!(stages[2].depends_on, vec![StateField::ResearchFindings]);
        assert_eq!(stages[3].depends_on, vec![StateField::Strategy]);
    }

    #[test]
    fn test_render_fills_input_fields() {
        let state = WorkflowState::new(sample_input());
        let context = RenderContext::from_state(&state, &[]);
        let prompt = render(&market_research().prompt_template, &context).unwrap();
        assert!(prompt.contains("Company Domain: acme.io"));
        assert!(prompt.contains("Target Market: Not specified"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn test_render_uses_fallback_for_optional_upstream_field() {
        let state = WorkflowState::new(sample_input());
        let context = RenderContext::from_state(&state, &trend_analysis().depends_on);
        let prompt = render(&trend_analysis().prompt_template, &context).unwrap();
        assert!(prompt.contains("No market research available"));
    }

    #[test]
    fn test_render_fails_for_missing_dependency() {
        let state = WorkflowState::new(sample_input());
        let spec = strategy_planning();
        let context = RenderContext::from_state(&state, &spec.depends_on);
        let err = render(&spec.prompt_template, &context).unwrap_err();
        assert_eq!(err, RenderError::MissingValue("market_research".to_string()));
        assert_eq!(err.to_string(), "placeholder '{{market_research}}' has no value in the current state");
    }

    #[test]
    fn test_render_includes_upstream_summary() {
        let mut state = WorkflowState::new(sample_input());
        state.merge(sample_result(StageId::MarketResearch));
        let spec = strategy_planning();
        let context = RenderContext::from_state(&state, &spec.depends_on);
        let prompt = render(&spec.prompt_template, &context).unwrap();
        assert!(prompt.contains("Customer Profile:"));
        assert!(prompt.contains("No trend analysis available"));
    }

    #[test]
    fn test_render_rejects_unterminated_placeholder() {
        let state = WorkflowState::new(sample_input());
        let context = RenderContext::from_state(&state, &[]);
        assert_eq!(render("Hello {{industry", &context), Err(RenderError::Unterminated));
    }

    #[test]
    fn test_project_brief_is_truncated() {
        let mut input = sample_input();
        input.project_description = "x".repeat(250);
        let state = WorkflowState::new(input);
        let context = RenderContext::from_state(&state, &[]);
        assert_eq!(context.get("project_brief").map(|s| s.len()), Some(100));
    }
}
