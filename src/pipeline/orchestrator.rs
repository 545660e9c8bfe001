//! The workflow orchestrator: runs the stage list in order over one state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::error::Result;
use crate::generation::claude::ClaudeClient;
use crate::generation::GenerationClient;
use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::executor::{StageExecutor, StageFailure};
use crate::pipeline::results::StructuredResult;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::stage::{default_stages, StageSpec};
use crate::pipeline::state::{
    RequestInput, RunOutcome, StageError, StageErrorKind, StageStatus, StageTrace, WorkflowState,
};
use crate::tools::web::WebGateway;
use crate::tools::{ToolCallStatus, ToolGateway, ToolSet};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// What the presentation layer receives when a run ends.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub state: WorkflowState,
}

enum StageRun {
    Finished(std::result::Result<StructuredResult, StageFailure>),
    Cancelled,
    TimedOut,
}

pub struct Orchestrator {
    stages: Vec<StageSpec>,
    generation: Arc<dyn GenerationClient>,
    gateway: Option<Arc<dyn ToolGateway>>,
    retry: RetryPolicy,
    run_timeout: Duration,
    tool_timeout: Duration,
    tool_concurrency: usize,
}

impl Orchestrator {
    /// An orchestrator over the default four-stage pipeline.
    pub fn new(generation: Arc<dyn GenerationClient>, gateway: Option<Arc<dyn ToolGateway>>) -> Self {
        Self {
            stages: default_stages(),
            generation,
            gateway,
            retry: RetryPolicy::default(),
            run_timeout: Duration::from_secs(600),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            tool_concurrency: 4,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let generation: Arc<dyn GenerationClient> = Arc::new(ClaudeClient::new(&config.generation)?);
        let gateway = match WebGateway::from_config(&config.search)? {
            Some(gateway) => Some(Arc::new(gateway) as Arc<dyn ToolGateway>),
            None => {
                tracing::warn!("No search API key configured; stages will run without tools");
                None
            }
        };

        Ok(Self::new(generation, gateway)
            .with_retry(config.pipeline.retry_policy())
            .with_run_timeout(config.pipeline.run_timeout())
            .with_tool_timeout(Duration::from_secs(config.search.timeout_secs))
            .with_tool_concurrency(config.pipeline.tool_concurrency))
    }

    pub fn with_stages(mut self, stages: Vec<StageSpec>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_tool_concurrency(mut self, concurrency: usize) -> Self {
        self.tool_concurrency = concurrency.max(1);
        self
    }

    /// Run every stage in order and return the final state.
    ///
    /// Stage failures are recorded in the state, never returned as errors.
    /// Cancellation and the run timeout end the run early with the state
    /// accumulated so far.
    pub async fn run(&self, input: RequestInput, cancel: &CancelSignal) -> RunReport {
        let span = tracing::info_span!("run", company = %input.company_domain);
        self.run_stages(input, cancel).instrument(span).await
    }

    async fn run_stages(&self, input: RequestInput, cancel: &CancelSignal) -> RunReport {
        let deadline = tokio::time::Instant::now() + self.run_timeout;
        let mut state = WorkflowState::new(input);

        tracing::info!(stages = self.stages.len(), "Starting workflow");

        for spec in &self.stages {
            let started_at = Utc::now();

            if cancel.is_cancelled() {
                tracing::info!(stage = %spec.id, "Run cancelled before stage started");
                state.record_error(StageError::new(spec.id, StageErrorKind::Cancelled, "run cancelled"));
                state.record_trace(trace(spec, StageStatus::Cancelled, 0, started_at, Vec::new()));
                break;
            }

            if let Some(missing) = state.missing_dependency(&spec.depends_on) {
                tracing::warn!(stage = %spec.id, missing = %missing, "Skipping stage: dependency missing");
                state.record_error(StageError::new(
                    spec.id,
                    StageErrorKind::SkippedDueToDependency,
                    format!("required field '{missing}' is not populated"),
                ));
                state.record_trace(trace(spec, StageStatus::Skipped, 0, started_at, Vec::new()));
                continue;
            }

            let tools = ToolSet::new(
                self.gateway.as_deref(),
                &spec.allowed_tools,
                self.tool_timeout,
                self.tool_concurrency,
            );
            let attempts = AtomicU32::new(0);

            let span = tracing::info_span!("stage", stage = %spec.id);
            let run = {
                let work = self
                    .execute_with_retry(spec, &state, &tools, &attempts)
                    .instrument(span);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => StageRun::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => StageRun::TimedOut,
                    result = work => StageRun::Finished(result),
                }
            };

            let attempts = attempts.load(Ordering::Relaxed);
            let tool_calls = tools.take_log();
            for call in &tool_calls {
                if let ToolCallStatus::Failed { message, .. } = &call.status {
                    state.record_error(StageError::new(
                        spec.id,
                        StageErrorKind::ToolInvocationError,
                        format!("{} '{}': {message}", call.tool, call.argument),
                    ));
                }
            }

            match run {
                StageRun::Finished(Ok(result)) => {
                    tracing::info!(stage = %spec.id, attempts, "Stage completed");
                    state.merge(result);
                    state.record_trace(trace(spec, StageStatus::Completed, attempts, started_at, tool_calls));
                }
                StageRun::Finished(Err(failure)) => {
                    tracing::error!(stage = %spec.id, attempts, error = %failure, "Stage failed");
                    state.record_error(
                        StageError::new(spec.id, failure.kind(), failure.to_string()).with_attempts(attempts),
                    );
                    state.record_trace(trace(spec, StageStatus::Failed, attempts, started_at, tool_calls));
                }
                StageRun::Cancelled => {
                    tracing::warn!(stage = %spec.id, "Run cancelled during stage");
                    state.record_error(
                        StageError::new(spec.id, StageErrorKind::Cancelled, "run cancelled").with_attempts(attempts),
                    );
                    state.record_trace(trace(spec, StageStatus::Cancelled, attempts, started_at, tool_calls));
                    break;
                }
                StageRun::TimedOut => {
                    tracing::warn!(stage = %spec.id, timeout = ?self.run_timeout, "Run timeout elapsed");
                    state.record_error(
                        StageError::new(spec.id, StageErrorKind::Cancelled, "run timeout elapsed")
                            .with_attempts(attempts),
                    );
                    state.record_trace(trace(spec, StageStatus::Cancelled, attempts, started_at, tool_calls));
                    break;
                }
            }
        }

        state.finish();
        let outcome = state.outcome(self.stages.len());
        tracing::info!(
            outcome = %outcome,
            completed = state.completed_stages().len(),
            errors = state.errors().len(),
            "Workflow finished"
        );

        RunReport { outcome, state }
    }

    async fn execute_with_retry(
        &self,
        spec: &StageSpec,
        state: &WorkflowState,
        tools: &ToolSet<'_>,
        attempts: &AtomicU32,
    ) -> std::result::Result<StructuredResult, StageFailure> {
        let executor = StageExecutor::new(self.generation.as_ref());
        let prompt = executor.prepare(spec, state, tools).await?;
        let policy = spec.retry.unwrap_or(self.retry);

        let mut hint: Option<String> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            attempts.store(attempt, Ordering::Relaxed);

            let failure = match executor.attempt(spec, &prompt, tools, hint.as_deref()).await {
                Ok(result) => return Ok(result),
                Err(failure) => failure,
            };

            if !failure.is_retryable() || attempt >= policy.max_attempts() {
                return Err(failure);
            }

            let delay = policy.delay_after(attempt, failure.retry_after());
            tracing::warn!(
                attempt,
                error = %failure,
                delay_ms = delay.as_millis() as u64,
                "Stage attempt failed, retrying"
            );

            hint = match &failure {
                StageFailure::Validation(e) => Some(e.to_string()),
                _ => None,
            };
            tokio::time::sleep(delay).await;
        }
    }
}

fn trace(
    spec: &StageSpec,
    status: StageStatus,
    attempts: u32,
    started_at: chrono::DateTime<Utc>,
    tool_calls: Vec<crate::tools::ToolCallRecord>,
) -> StageTrace {
    StageTrace {
        stage: spec.id,
        status,
        attempts,
        started_at,
        finished_at: Utc::now(),
        tool_calls,
    }
}
