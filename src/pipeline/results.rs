//! Typed stage results.
//!
//! Each stage's raw output is checked by the validator against the stage's
//! [`Schema`](crate::pipeline::schema::Schema) and then converted into one of
//! these types, so downstream stages never read untyped data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pipeline::state::StageId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketResearch {
    pub customer_profile: BTreeMap<String, String>,
    pub competitors: Vec<BTreeMap<String, String>>,
    pub target_audience: BTreeMap<String, String>,
    pub market_positioning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub market_trends: Vec<String>,
    pub tech_trends: Vec<String>,
    pub consumer_trends: Vec<String>,
    pub trend_impact: String,
    pub opportunities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketingStrategy {
    pub name: String,
    pub goals: Vec<String>,
    pub tactics: Vec<String>,
    pub channels: Vec<String>,
    pub kpis: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignIdea {
    pub name: String,
    pub description: String,
    pub audience: String,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketingCopy {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignContent {
    pub campaign_ideas: Vec<CampaignIdea>,
    pub copies: Vec<MarketingCopy>,
}

/// A schema-validated output of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", content = "result", rename_all = "snake_case")]
pub enum StructuredResult {
    MarketResearch(MarketResearch),
    TrendAnalysis(TrendAnalysis),
    StrategyPlanning(MarketingStrategy),
    ContentCreation(CampaignContent),
}

impl StructuredResult {
    /// Convert a validated value into the typed result for `stage`.
    pub fn from_validated(stage: StageId, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match stage {
            StageId::MarketResearch => Self::MarketResearch(serde_json::from_value(value)?),
            StageId::TrendAnalysis => Self::TrendAnalysis(serde_json::from_value(value)?),
            StageId::StrategyPlanning => Self::StrategyPlanning(serde_json::from_value(value)?),
            StageId::ContentCreation => Self::ContentCreation(serde_json::from_value(value)?),
        })
    }

    pub fn stage(&self) -> StageId {
        match self {
            Self::MarketResearch(_) => StageId::MarketResearch,
            Self::TrendAnalysis(_) => StageId::TrendAnalysis,
            Self::StrategyPlanning(_) => StageId::StrategyPlanning,
            Self::ContentCreation(_) => StageId::ContentCreation,
        }
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn lookup<'a>(map: &'a BTreeMap<String, String>, key: &str) -> &'a str {
    map.get(key).map(String::as_str).unwrap_or("N/A")
}

impl MarketResearch {
    /// Prompt-ready summary used as context by later stages.
    pub fn summary(&self) -> String {
        let competitors = self
            .competitors
            .iter()
            .take(3)
            .map(|c| lookup(c, "name"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Customer Profile:\n\
             - Company: {}\n\
             - Products/Services: {}\n\
             - Market Position: {}\n\n\
             Target Audience:\n{}\n\n\
             Market Positioning: {}\n\n\
             Key Competitors: {competitors}",
            lookup(&self.customer_profile, "company_name"),
            lookup(&self.customer_profile, "products_services"),
            lookup(&self.customer_profile, "market_position"),
            self.audience_summary(),
            self.market_positioning,
        )
    }

    pub fn audience_summary(&self) -> String {
        format!(
            "- Demographics: {}\n- Preferences: {}\n- Pain Points: {}\n- Behavior: {}",
            lookup(&self.target_audience, "demographics"),
            lookup(&self.target_audience, "preferences"),
            lookup(&self.target_audience, "pain_points"),
            lookup(&self.target_audience, "behavior"),
        )
    }
}

impl TrendAnalysis {
    pub fn summary(&self) -> String {
        format!(
            "Market Trends:\n{}\n\nTechnology Trends:\n{}\n\nConsumer Trends:\n{}\n\n\
             Trend Impact: {}\n\nIdentified Opportunities:\n{}",
            bullet_list(&self.market_trends),
            bullet_list(&self.tech_trends),
            bullet_list(&self.consumer_trends),
            self.trend_impact,
            bullet_list(&self.opportunities),
        )
    }
}

impl MarketingStrategy {
    pub fn summary(&self) -> String {
        format!(
            "Strategy Name: {}\n\nGoals:\n{}\n\nTactics:\n{}\n\nChannels:\n{}\n\nKPIs:\n{}",
            self.name,
            bullet_list(&self.goals),
            bullet_list(&self.tactics),
            bullet_list(&self.channels),
            bullet_list(&self.kpis),
        )
    }
}

impl CampaignContent {
    pub fn summary(&self) -> String {
        self.campaign_ideas
            .iter()
            .enumerate()
            .map(|(i, idea)| {
                format!(
                    "{}. {} ({} via {}): {}",
                    i + 1,
                    idea.name,
                    idea.audience,
                    idea.channel,
                    idea.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
