//! Markdown export of a finished run.
//!
//! Every populated field is rendered; errors always get their own section so
//! a partial report cannot pass for a complete one.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::pipeline::orchestrator::RunReport;
use crate::pipeline::results::{CampaignContent, MarketResearch, MarketingStrategy, TrendAnalysis};
use crate::pipeline::state::{RunOutcome, StageId, WorkflowState};

pub fn render_markdown(report: &RunReport) -> String {
    let state = &report.state;
    let input = state.input();
    let mut out = String::new();

    let _ = writeln!(out, "# Marketing Strategy Report: {}\n", input.company_domain);
    let _ = writeln!(out, "- **Industry:** {}", input.industry);
    let _ = writeln!(
        out,
        "- **Target market:** {}",
        input.target_market.as_deref().unwrap_or("Not specified")
    );
    let _ = writeln!(out, "- **Goals:** {}", input.goals.as_deref().unwrap_or("Not specified"));
    let _ = writeln!(out, "- **Started:** {}", format_time(state.started_at()));
    if let Some(finished_at) = state.finished_at() {
        let _ = writeln!(out, "- **Finished:** {}", format_time(finished_at));
    }
    let _ = writeln!(out, "- **Outcome:** {}", report.outcome);
    let _ = writeln!(
        out,
        "- **Completed stages:** {}/{}\n",
        state.completed_stages().len(),
        StageId::ALL.len()
    );

    if report.outcome != RunOutcome::FullSuccess {
        out.push_str("> This report is incomplete. See the Errors section below.\n\n");
    }

    section(&mut out, "Market Research", state.research_findings(), render_research);
    section(&mut out, "Trend Analysis", state.trend_findings(), render_trends);
    section(&mut out, "Marketing Strategy", state.strategy(), render_strategy);
    section(&mut out, "Campaign Content", state.content(), render_content);
    render_errors(&mut out, state);

    out
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn section<T>(out: &mut String, title: &str, value: Option<&T>, render: fn(&mut String, &T)) {
    let _ = writeln!(out, "## {title}\n");
    match value {
        Some(value) => render(out, value),
        None => out.push_str("_Not available._\n"),
    }
    out.push('\n');
}

fn bullets(out: &mut String, items: &[String]) {
    for item in items {
        let _ = writeln!(out, "- {item}");
    }
}

fn key_values(out: &mut String, map: &BTreeMap<String, String>) {
    for (key, value) in map {
        let _ = writeln!(out, "- **{}:** {value}", humanize(key));
    }
}

fn humanize(key: &str) -> String {
    let spaced = key.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn render_research(out: &mut String, research: &MarketResearch) {
    out.push_str("### Customer Profile\n\n");
    key_values(out, &research.customer_profile);

    out.push_str("\n### Competitors\n\n");
    for competitor in &research.competitors {
        let name = competitor.get("name").map(String::as_str).unwrap_or("Unnamed");
        let _ = writeln!(out, "#### {name}\n");
        let details: BTreeMap<String, String> = competitor
            .iter()
            .filter(|(key, _)| key.as_str() != "name")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        key_values(out, &details);
        out.push('\n');
    }

    out.push_str("### Target Audience\n\n");
    key_values(out, &research.target_audience);
    let _ = writeln!(out, "\n### Market Positioning\n\n{}", research.market_positioning);
}

fn render_trends(out: &mut String, trends: &TrendAnalysis) {
    for (title, items) in [
        ("Market Trends", &trends.market_trends),
        ("Technology Trends", &trends.tech_trends),
        ("Consumer Trends", &trends.consumer_trends),
    ] {
        let _ = writeln!(out, "### {title}\n");
        bullets(out, items);
        out.push('\n');
    }
    let _ = writeln!(out, "### Impact\n\n{}\n", trends.trend_impact);
    out.push_str("### Opportunities\n\n");
    bullets(out, &trends.opportunities);
}

fn render_strategy(out: &mut String, strategy: &MarketingStrategy) {
    let _ = writeln!(out, "**{}**", strategy.name);
    if let Some(priority) = strategy.priority {
        let _ = writeln!(out, "\nPriority: {priority:?}");
    }
    for (title, items) in [
        ("Goals", &strategy.goals),
        ("Tactics", &strategy.tactics),
        ("Channels", &strategy.channels),
        ("KPIs", &strategy.kpis),
    ] {
        let _ = writeln!(out, "\n### {title}\n");
        bullets(out, items);
    }
}

fn render_content(out: &mut String, content: &CampaignContent) {
    out.push_str("### Campaign Ideas\n\n");
    for (i, idea) in content.campaign_ideas.iter().enumerate() {
        let _ = writeln!(out, "{}. **{}** ({} via {})", i + 1, idea.name, idea.audience, idea.channel);
        let _ = writeln!(out, "   {}", idea.description);
    }

    out.push_str("\n### Marketing Copy\n");
    for copy in &content.copies {
        let _ = writeln!(out, "\n#### {}\n\n{}", copy.title, copy.body);
    }
}

fn render_errors(out: &mut String, state: &WorkflowState) {
    out.push_str("## Errors\n\n");
    if state.errors().is_empty() {
        out.push_str("None.\n");
        return;
    }

    out.push_str("| Stage | Kind | Attempts | Message |\n|---|---|---|---|\n");
    for error in state.errors() {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |",
            error.stage,
            error.kind,
            error.attempts,
            error.message.replace('|', "\\|").replace('\n', " ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::{StageError, StageErrorKind};
    use crate::testing::{sample_input, sample_result};

    fn report(state: WorkflowState) -> RunReport {
        RunReport {
            outcome: state.outcome(StageId::ALL.len()),
            state,
        }
    }

    #[test]
    fn test_full_report_has_every_section() {
        let mut state = WorkflowState::new(sample_input());
        for stage in StageId::ALL {
            state.merge(sample_result(stage));
        }

        let started = format_time(state.started_at());
        let markdown = render_markdown(&report(state));
        assert!(markdown.starts_with("# Marketing Strategy Report: acme.io"));
        assert!(markdown.contains(&format!("- **Started:** {started}")));
        assert!(!markdown.contains("**Finished:**"));
        assert!(markdown.contains("- **Outcome:** full success"));
        assert!(markdown.contains("#### Globex"));
        assert!(markdown.contains("- **Pain points:** Fragmented store data"));
        assert!(markdown.contains("Priority: High"));
        assert!(markdown.contains("1. **Store Pulse** (Operations leads via Email)"));
        assert!(markdown.contains("## Errors\n\nNone."));
        assert!(!markdown.contains("incomplete"));
    }

    #[test]
    fn test_partial_report_surfaces_errors() {
        let mut state = WorkflowState::new(sample_input());
        state.merge(sample_result(StageId::TrendAnalysis));
        state.record_error(
            StageError::new(StageId::MarketResearch, StageErrorKind::GenerationFailed, "API returned 500 | boom")
                .with_attempts(3),
        );
        state.finish();

        let markdown = render_markdown(&report(state));
        assert!(markdown.contains("- **Finished:** "));
        assert!(markdown.contains("> This report is incomplete."));
        assert!(markdown.contains("## Market Research\n\n_Not available._"));
        assert!(markdown.contains("### Market Trends"));
        assert!(markdown.contains("| market_research | generation failed | 3 | API returned 500 \\| boom |"));
    }
}
