//! Prompt templates bundled at compile time, plus the renderers that turn a
//! stage input into the text sent to the model.

use serde_json::Value;

use super::task::{DependencyInput, StageInput};
use super::StageName;

/// Normalize Idea - restates the raw idea in structured form
pub const NORMALIZE_IDEA: &str = include_str!("defaults/normalize_idea.md");

/// Market Research - trends and customer segments
pub const MARKET_RESEARCH: &str = include_str!("defaults/market_research.md");

/// Market Sizing - TAM / SAM / SOM
pub const MARKET_SIZING: &str = include_str!("defaults/market_sizing.md");

/// Competition - competitor scan and differentiation
pub const COMPETITION: &str = include_str!("defaults/competition.md");

/// Feasibility - technical, financial and regulatory risk
pub const FEASIBILITY: &str = include_str!("defaults/feasibility.md");

/// Strategy - positioning and go-to-market
pub const STRATEGY: &str = include_str!("defaults/strategy.md");

/// Report - final verdict
pub const REPORT: &str = include_str!("defaults/report.md");

/// Marker substituted for a dependency whose stage failed
pub const SOURCE_UNAVAILABLE: &str = "[source unavailable: this analysis could not be completed]";

/// System instructions for a stage
pub fn system_prompt(stage: StageName) -> &'static str {
    match stage {
        StageName::NormalizeIdea => NORMALIZE_IDEA,
        StageName::MarketResearch => MARKET_RESEARCH,
        StageName::MarketSizing => MARKET_SIZING,
        StageName::Competition => COMPETITION,
        StageName::Feasibility => FEASIBILITY,
        StageName::Strategy => STRATEGY,
        StageName::Report => REPORT,
    }
}

/// Render the user prompt for a stage input
pub fn render(input: &StageInput) -> String {
    let mut prompt = format!(
        "{}\n\n## Submitted idea\n\n{}\n",
        system_prompt(input.stage).trim(),
        input.idea_text.trim()
    );

    for (name, dependency) in &input.dependencies {
        prompt.push_str(&format!("\n## {} ({})\n\n", name.label(), name));
        match dependency {
            DependencyInput::Available(value) => prompt.push_str(&pretty(value)),
            DependencyInput::Unavailable => prompt.push_str(SOURCE_UNAVAILABLE),
        }
        prompt.push('\n');
    }

    prompt
}

/// Render a schema-guided repair request after a validation failure
pub fn render_repair(original: &str, previous: &Value, error: &str, schema: &Value) -> String {
    format!(
        "{}\n\n## Correction required\n\nYour previous response did not match the required \
         schema.\n\nValidation error: {}\n\nPrevious response:\n{}\n\nRequired JSON schema:\n{}\n\n\
         Respond again with a single JSON object that satisfies the schema. Do not include any \
         other text.\n",
        original,
        error,
        pretty(previous),
        pretty(schema)
    )
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
