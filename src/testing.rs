//! Deterministic capability mocks shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::generation::{GenerationClient, GenerationError, GenerationRequest, RawOutput};
use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::results::StructuredResult;
use crate::pipeline::state::{RequestInput, StageId};
use crate::tools::{PageContent, SearchResult, ToolError, ToolGateway, ToolKind, ToolSet};

pub fn sample_input() -> RequestInput {
    RequestInput {
        company_domain: "acme.io".to_string(),
        industry: "SaaS".to_string(),
        project_description: "Launch an AI-powered analytics dashboard for mid-sized retail chains in Europe."
            .to_string(),
        target_market: None,
        goals: Some("Reach 500 paying customers in the first year".to_string()),
    }
}

/// Schema-valid generation output for `stage`.
pub fn canned_output(stage: StageId) -> String {
    let value = match stage {
        StageId::MarketResearch => json!({
            "customer_profile": {
                "company_name": "Acme",
                "industry": "SaaS",
                "products_services": "Retail analytics",
                "market_position": "Challenger"
            },
            "competitors": [
                { "name": "Globex", "strengths": "Brand", "weaknesses": "Price", "differentiation": "Enterprise focus" }
            ],
            "target_audience": {
                "demographics": "Operations leads at retail chains",
                "preferences": "Self-serve tools",
                "pain_points": "Fragmented store data",
                "behavior": "Research on LinkedIn"
            },
            "market_positioning": "Affordable analytics for mid-market retail"
        }),
        StageId::TrendAnalysis => json!({
            "market_trends": ["Consolidation of retail tooling"],
            "tech_trends": ["Embedded AI assistants"],
            "consumer_trends": ["Omnichannel shopping"],
            "trend_impact": "Demand for unified store insights is growing",
            "opportunities": ["Bundle forecasting with dashboards"]
        }),
        StageId::StrategyPlanning => json!({
            "name": "Retail Insight Launch",
            "goals": ["500 paying customers"],
            "tactics": ["Webinars with retail associations"],
            "channels": ["LinkedIn", "Email"],
            "KPIs": ["Trial-to-paid conversion"],
            "priority": "High"
        }),
        StageId::ContentCreation => json!({
            "campaign_ideas": [
                {
                    "name": "Store Pulse",
                    "description": "Weekly benchmark reports for store managers",
                    "audience": "Operations leads",
                    "channel": "Email"
                }
            ],
            "copies": [
                { "title": "Know every store", "body": "See all your locations in one dashboard." }
            ]
        }),
    };
    value.to_string()
}

/// The typed result `canned_output(stage)` validates into.
pub fn sample_result(stage: StageId) -> StructuredResult {
    let spec = crate::pipeline::stage::default_stages()
        .into_iter()
        .find(|s| s.id == stage)
        .expect("stage is part of the default pipeline");
    let raw: Value = serde_json::from_str(&canned_output(stage)).unwrap();
    let validated = spec.output_schema.validate(&raw).unwrap();
    StructuredResult::from_validated(stage, validated).unwrap()
}

enum Reply {
    Text(String),
    Fail(GenerationError),
    CancelAndHang(CancelSignal),
    Hang,
    UseTool { name: String, input: Value },
}

/// Generation client that replays queued replies per stage and falls back to
/// [`canned_output`] once a queue is empty.
#[derive(Default)]
pub struct ScriptedGeneration {
    replies: Mutex<HashMap<StageId, VecDeque<Reply>>>,
    always_failing: HashSet<StageId>,
    prompts: Mutex<HashMap<StageId, Vec<String>>>,
}

impl ScriptedGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, stage: StageId, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn reply(self, stage: StageId, reply: Result<String, GenerationError>) -> Self {
        match reply {
            Ok(text) => self.push(stage, Reply::Text(text)),
            Err(e) => self.push(stage, Reply::Fail(e)),
        }
    }

    pub fn always_fail(mut self, stage: StageId) -> Self {
        self.always_failing.insert(stage);
        self
    }

    /// Fire `cancel` from inside the call, then never return.
    pub fn cancel_during(self, stage: StageId, cancel: CancelSignal) -> Self {
        self.push(stage, Reply::CancelAndHang(cancel))
    }

    pub fn hang(self, stage: StageId) -> Self {
        self.push(stage, Reply::Hang)
    }

    /// Request a tool through the stage's tool set before answering.
    pub fn use_tool(self, stage: StageId, name: &str, input: Value) -> Self {
        self.push(
            stage,
            Reply::UseTool {
                name: name.to_string(),
                input,
            },
        )
    }

    pub fn calls(&self, stage: StageId) -> usize {
        self.prompts.lock().unwrap().get(&stage).map_or(0, Vec::len)
    }

    pub fn prompts(&self, stage: StageId) -> Vec<String> {
        self.prompts.lock().unwrap().get(&stage).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl GenerationClient for ScriptedGeneration {
    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
        tools: &ToolSet<'_>,
    ) -> Result<RawOutput, GenerationError> {
        self.prompts
            .lock()
            .unwrap()
            .entry(request.stage)
            .or_default()
            .push(request.prompt.clone());

        if self.always_failing.contains(&request.stage) {
            return Err(GenerationError::Unavailable("scripted outage".to_string()));
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&request.stage)
            .and_then(VecDeque::pop_front);

        match reply {
            None => Ok(RawOutput::text(canned_output(request.stage))),
            Some(Reply::Text(text)) => Ok(RawOutput::text(text)),
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::CancelAndHang(cancel)) => {
                cancel.cancel();
                std::future::pending().await
            }
            Some(Reply::Hang) => std::future::pending().await,
            Some(Reply::UseTool { name, input }) => {
                tools.invoke(&name, &input).await;
                Ok(RawOutput::text(canned_output(request.stage)))
            }
        }
    }
}

enum Behavior {
    Fail(ToolError),
    Hang,
}

/// Tool gateway with canned responses that records every call it receives.
pub struct RecordingGateway {
    behaviors: HashMap<String, Behavior>,
    result_count: usize,
    calls: Mutex<Vec<(ToolKind, String)>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            result_count: 2,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls whose argument equals `argument` fail with `error`.
    pub fn failing(mut self, argument: &str, error: ToolError) -> Self {
        self.behaviors.insert(argument.to_string(), Behavior::Fail(error));
        self
    }

    /// Calls whose argument equals `argument` never complete.
    pub fn hanging(mut self, argument: &str) -> Self {
        self.behaviors.insert(argument.to_string(), Behavior::Hang);
        self
    }

    pub fn with_result_count(mut self, count: usize) -> Self {
        self.result_count = count;
        self
    }

    pub fn calls(&self) -> Vec<(ToolKind, String)> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, kind: ToolKind, argument: &str) -> Result<(), ToolError> {
        self.calls.lock().unwrap().push((kind, argument.to_string()));
        match self.behaviors.get(argument) {
            Some(Behavior::Fail(e)) => Err(e.clone()),
            Some(Behavior::Hang) => std::future::pending().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ToolGateway for RecordingGateway {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ToolError> {
        self.record(ToolKind::Search, query).await?;
        Ok((1..=self.result_count)
            .map(|i| SearchResult {
                title: format!("Result {i} for {query}"),
                snippet: format!("Snippet {i} about {query}"),
                link: format!("https://example.com/{i}"),
            })
            .collect())
    }

    async fn fetch(&self, url: &str) -> Result<PageContent, ToolError> {
        self.record(ToolKind::Fetch, url).await?;
        Ok(PageContent {
            url: url.to_string(),
            title: Some("Acme".to_string()),
            text: "Acme builds retail analytics.".to_string(),
            truncated: false,
        })
    }
}
