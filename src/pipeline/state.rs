//! The shared workflow state threaded through every stage of a run.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::pipeline::results::{
    CampaignContent, MarketResearch, MarketingStrategy, StructuredResult, TrendAnalysis,
};
use crate::tools::ToolCallRecord;

const MIN_DESCRIPTION_CHARS: usize = 50;

/// The structured request a run is started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInput {
    pub company_domain: String,
    pub industry: String,
    pub project_description: String,
    #[serde(default)]
    pub target_market: Option<String>,
    #[serde(default)]
    pub goals: Option<String>,
}

impl RequestInput {
    pub fn validate(&self) -> Result<()> {
        if self.company_domain.trim().is_empty() {
            return Err(AppError::InvalidInput("Company domain is required".to_string()));
        }
        if self.industry.trim().is_empty() {
            return Err(AppError::InvalidInput("Industry is required".to_string()));
        }
        let description = self.project_description.trim();
        if description.is_empty() {
            return Err(AppError::InvalidInput("Project description is required".to_string()));
        }
        if description.chars().count() < MIN_DESCRIPTION_CHARS {
            return Err(AppError::InvalidInput(format!(
                "Project description should be at least {MIN_DESCRIPTION_CHARS} characters"
            )));
        }
        Ok(())
    }
}

/// Identifies one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    MarketResearch,
    TrendAnalysis,
    StrategyPlanning,
    ContentCreation,
}

impl StageId {
    pub const ALL: [StageId; 4] = [
        StageId::MarketResearch,
        StageId::TrendAnalysis,
        StageId::StrategyPlanning,
        StageId::ContentCreation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::MarketResearch => "market_research",
            StageId::TrendAnalysis => "trend_analysis",
            StageId::StrategyPlanning => "strategy_planning",
            StageId::ContentCreation => "content_creation",
        }
    }

    /// The state field this stage is the sole writer of.
    pub fn output_field(&self) -> StateField {
        match self {
            StageId::MarketResearch => StateField::ResearchFindings,
            StageId::TrendAnalysis => StateField::TrendFindings,
            StageId::StrategyPlanning => StateField::Strategy,
            StageId::ContentCreation => StateField::Content,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The optional, stage-populated fields of [`WorkflowState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    ResearchFindings,
    TrendFindings,
    Strategy,
    Content,
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateField::ResearchFindings => "research_findings",
            StateField::TrendFindings => "trend_findings",
            StateField::Strategy => "strategy",
            StateField::Content => "content",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    SkippedDueToDependency,
    PromptRenderError,
    ToolInvocationError,
    GenerationFailed,
    ValidationFailed,
    Cancelled,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageErrorKind::SkippedDueToDependency => "skipped (missing dependency)",
            StageErrorKind::PromptRenderError => "prompt render error",
            StageErrorKind::ToolInvocationError => "tool invocation error",
            StageErrorKind::GenerationFailed => "generation failed",
            StageErrorKind::ValidationFailed => "validation failed",
            StageErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A recorded stage-level failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: StageId,
    pub kind: StageErrorKind,
    pub message: String,
    /// Generation attempts made before the error was recorded.
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl StageError {
    pub fn new(stage: StageId, kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            attempts: 0,
            at: Utc::now(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Execution trace of one stage: attempts, timing and every tool call made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTrace {
    pub stage: StageId,
    pub status: StageStatus,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Overall classification of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    FullSuccess,
    PartialSuccess,
    TotalFailure,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunOutcome::FullSuccess => "full success",
            RunOutcome::PartialSuccess => "partial success",
            RunOutcome::TotalFailure => "total failure",
        };
        f.write_str(name)
    }
}

/// The single record threaded through the pipeline for one run.
///
/// Stage fields are written only through [`WorkflowState::merge`]; `errors`
/// and `completed_stages` only grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    input: RequestInput,
    research_findings: Option<MarketResearch>,
    trend_findings: Option<TrendAnalysis>,
    strategy: Option<MarketingStrategy>,
    content: Option<CampaignContent>,
    errors: Vec<StageError>,
    completed_stages: BTreeSet<StageId>,
    traces: Vec<StageTrace>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn new(input: RequestInput) -> Self {
        Self {
            input,
            research_findings: None,
            trend_findings: None,
            strategy: None,
            content: None,
            errors: Vec::new(),
            completed_stages: BTreeSet::new(),
            traces: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn input(&self) -> &RequestInput {
        &self.input
    }

    pub fn research_findings(&self) -> Option<&MarketResearch> {
        self.research_findings.as_ref()
    }

    pub fn trend_findings(&self) -> Option<&TrendAnalysis> {
        self.trend_findings.as_ref()
    }

    pub fn strategy(&self) -> Option<&MarketingStrategy> {
        self.strategy.as_ref()
    }

    pub fn content(&self) -> Option<&CampaignContent> {
        self.content.as_ref()
    }

    pub fn errors(&self) -> &[StageError] {
        &self.errors
    }

    pub fn completed_stages(&self) -> &BTreeSet<StageId> {
        &self.completed_stages
    }

    pub fn traces(&self) -> &[StageTrace] {
        &self.traces
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn has_field(&self, field: StateField) -> bool {
        match field {
            StateField::ResearchFindings => self.research_findings.is_some(),
            StateField::TrendFindings => self.trend_findings.is_some(),
            StateField::Strategy => self.strategy.is_some(),
            StateField::Content => self.content.is_some(),
        }
    }

    /// First declared dependency that is not populated, if any.
    pub fn missing_dependency(&self, depends_on: &[StateField]) -> Option<StateField> {
        depends_on.iter().copied().find(|field| !self.has_field(*field))
    }

    /// Move a stage's result into its field and mark the stage completed.
    ///
    /// The result variant decides the field, so a stage can only ever write
    /// its own field. Merging again (e.g. after a retry) replaces the value.
    pub fn merge(&mut self, result: StructuredResult) {
        let stage = result.stage();
        match result {
            StructuredResult::MarketResearch(r) => self.research_findings = Some(r),
            StructuredResult::TrendAnalysis(r) => self.trend_findings = Some(r),
            StructuredResult::StrategyPlanning(r) => self.strategy = Some(r),
            StructuredResult::ContentCreation(r) => self.content = Some(r),
        }
        self.completed_stages.insert(stage);
    }

    pub fn record_error(&mut self, error: StageError) {
        self.errors.push(error);
    }

    pub fn record_trace(&mut self, trace: StageTrace) {
        self.traces.push(trace);
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Classify the run given how many stages the pipeline declared.
    pub fn outcome(&self, total_stages: usize) -> RunOutcome {
        let completed = self.completed_stages.len();
        if completed == 0 {
            RunOutcome::TotalFailure
        } else if completed >= total_stages {
            RunOutcome::FullSuccess
        } else {
            RunOutcome::PartialSuccess
        }
    }

    pub fn errors_for(&self, stage: StageId) -> impl Iterator<Item = &StageError> {
        self.errors.iter().filter(move |e| e.stage == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_input, sample_result};

    #[test]
    fn test_validate_accepts_sample_input() {
        assert!(sample_input().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_description() {
        let mut input = sample_input();
        input.project_description = "Too short".to_string();
        let err = input.validate().unwrap_err().to_string();
        assert!(err.contains("at least 50 characters"));
    }

    #[test]
    fn test_validate_rejects_blank_company() {
        let mut input = sample_input();
        input.company_domain = "   ".to_string();
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_merge_populates_only_own_field() {
        let mut state = WorkflowState::new(sample_input());
        state.merge(sample_result(StageId::TrendAnalysis));

        assert!(state.trend_findings().is_some());
        assert!(state.research_findings().is_none());
        assert!(state.strategy().is_none());
        assert!(state.content().is_none());
        assert!(state.completed_stages().contains(&StageId::TrendAnalysis));
    }

    #[test]
    fn test_merge_twice_with_identical_output_is_idempotent() {
        let mut state = WorkflowState::new(sample_input());
        state.merge(sample_result(StageId::ContentCreation));
        let first = state.content().cloned();
        state.merge(sample_result(StageId::ContentCreation));

        assert_eq!(state.content().cloned(), first);
        assert_eq!(
            state.content().map(|c| c.campaign_ideas.len()),
            first.map(|c| c.campaign_ideas.len())
        );
        assert_eq!(state.completed_stages().len(), 1);
    }

    #[test]
    fn test_errors_and_completed_stages_only_grow() {
        let mut state = WorkflowState::new(sample_input());
        let mut errors_seen = 0;
        let mut completed_seen = BTreeSet::new();

        let mut check = |state: &WorkflowState| {
            assert!(state.errors().len() >= errors_seen);
            assert!(state.completed_stages().is_superset(&completed_seen));
            errors_seen = state.errors().len();
            completed_seen = state.completed_stages().clone();
        };

        state.merge(sample_result(StageId::MarketResearch));
        check(&state);
        state.record_error(StageError::new(
            StageId::TrendAnalysis,
            StageErrorKind::GenerationFailed,
            "overloaded",
        ));
        check(&state);
        // A retried stage merging again must not drop earlier entries.
        state.merge(sample_result(StageId::MarketResearch));
        check(&state);
        state.merge(sample_result(StageId::StrategyPlanning));
        check(&state);
        state.record_error(StageError::new(
            StageId::ContentCreation,
            StageErrorKind::ValidationFailed,
            "missing copies",
        ));
        check(&state);

        assert_eq!(errors_seen, 2);
        assert_eq!(
            completed_seen,
            BTreeSet::from([StageId::MarketResearch, StageId::StrategyPlanning])
        );
    }

    #[test]
    fn test_missing_dependency_checks_each_declared_field() {
        let mut state = WorkflowState::new(sample_input());
        state.merge(sample_result(StageId::TrendAnalysis));

        assert_eq!(
            state.missing_dependency(&[StateField::ResearchFindings]),
            Some(StateField::ResearchFindings)
        );
        assert_eq!(state.missing_dependency(&[StateField::TrendFindings]), None);
        assert_eq!(state.missing_dependency(&[]), None);
    }

    #[test]
    fn test_outcome_classification() {
        let mut state = WorkflowState::new(sample_input());
        assert_eq!(state.outcome(4), RunOutcome::TotalFailure);

        state.merge(sample_result(StageId::MarketResearch));
        assert_eq!(state.outcome(4), RunOutcome::PartialSuccess);

        for stage in StageId::ALL {
            state.merge(sample_result(stage));
        }
        assert_eq!(state.outcome(4), RunOutcome::FullSuccess);
    }

    #[test]
    fn test_state_serializes_for_presentation() {
        let mut state = WorkflowState::new(sample_input());
        state.record_error(StageError::new(
            StageId::MarketResearch,
            StageErrorKind::GenerationFailed,
            "boom",
        ));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["errors"][0]["kind"], "generation_failed");
        assert_eq!(json["errors"][0]["stage"], "market_research");
        assert!(json["research_findings"].is_null());
    }
}
