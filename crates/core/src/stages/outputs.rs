//! # Stage Output Schemas
//!
//! One typed output per stage. The JSON schema sent to the model is derived
//! from these types, and responses are validated by deserializing into them.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A typed stage output
pub trait StageOutput: JsonSchema + DeserializeOwned + Serialize {
    /// Schema name sent as the inference schema hint
    const NAME: &'static str;

    /// Semantic checks beyond the structural ones serde performs
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Type-erased handle to a stage's output schema
#[derive(Clone, Copy)]
pub struct OutputSchema {
    pub name: &'static str,
    schema: fn() -> Value,
    validate: fn(Value) -> Result<Value, String>,
}

impl OutputSchema {
    pub fn of<T: StageOutput>() -> Self {
        Self {
            name: T::NAME,
            schema: schema_of::<T>,
            validate: validate_as::<T>,
        }
    }

    /// JSON schema for the output type
    pub fn schema(&self) -> Value {
        (self.schema)()
    }

    /// Validate a raw response, returning the normalized payload
    pub fn validate(&self, raw: Value) -> Result<Value, String> {
        (self.validate)(raw)
    }
}

impl fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSchema").field("name", &self.name).finish()
    }
}

fn schema_of<T: StageOutput>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

fn validate_as<T: StageOutput>(raw: Value) -> Result<Value, String> {
    let typed: T = serde_json::from_value(raw).map_err(|e| e.to_string())?;
    typed.check()?;
    serde_json::to_value(&typed).map_err(|e| e.to_string())
}

fn check_score(field: &str, score: u8) -> Result<(), String> {
    if score > 100 {
        return Err(format!("{} must be between 0 and 100, got {}", field, score));
    }
    Ok(())
}

// === normalize_idea ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NormalizedIdea {
    /// Short product name or working title
    pub title: String,
    /// One-paragraph restatement of the idea
    pub summary: String,
    /// The problem being solved
    pub problem: String,
    pub target_customers: Vec<String>,
    pub value_proposition: String,
    pub industry: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl StageOutput for NormalizedIdea {
    const NAME: &'static str = "normalize_idea";

    fn check(&self) -> Result<(), String> {
        if self.title.trim().is_empty() || self.summary.trim().is_empty() {
            return Err("title and summary must not be empty".to_string());
        }
        Ok(())
    }
}

// === market_research ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MarketTrend {
    pub name: String,
    pub description: String,
    /// positive, negative or neutral
    pub impact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CustomerSegment {
    pub name: String,
    pub needs: Vec<String>,
    #[serde(default)]
    pub size_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MarketResearch {
    pub overview: String,
    pub trends: Vec<MarketTrend>,
    pub segments: Vec<CustomerSegment>,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl StageOutput for MarketResearch {
    const NAME: &'static str = "market_research";
}

// === market_sizing ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MarketFigure {
    pub value_usd: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MarketSizing {
    pub tam: MarketFigure,
    pub sam: MarketFigure,
    pub som: MarketFigure,
    pub growth_rate_percent: f64,
    #[serde(default)]
    pub assumptions: Vec<String>,
}

impl StageOutput for MarketSizing {
    const NAME: &'static str = "market_sizing";

    fn check(&self) -> Result<(), String> {
        if self.sam.value_usd > self.tam.value_usd || self.som.value_usd > self.sam.value_usd {
            return Err("market figures must satisfy SOM <= SAM <= TAM".to_string());
        }
        Ok(())
    }
}

// === competition ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Saturation {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Competitor {
    pub name: String,
    pub description: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CompetitionScan {
    pub competitors: Vec<Competitor>,
    pub saturation: Saturation,
    /// How the idea can stand apart
    pub differentiation: String,
}

impl StageOutput for CompetitionScan {
    const NAME: &'static str = "competition";
}

// === feasibility ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Risk {
    pub description: String,
    /// low, medium or high
    pub severity: String,
    pub mitigation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FeasibilityAssessment {
    /// Overall feasibility, 0-100
    pub score: u8,
    pub technical: String,
    pub financial: String,
    pub regulatory: String,
    pub risks: Vec<Risk>,
}

impl StageOutput for FeasibilityAssessment {
    const NAME: &'static str = "feasibility";

    fn check(&self) -> Result<(), String> {
        check_score("score", self.score)
    }
}

// === strategy ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Milestone {
    pub title: String,
    pub timeframe: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StrategyRecommendation {
    pub positioning: String,
    pub go_to_market: Vec<String>,
    pub pricing: String,
    pub milestones: Vec<Milestone>,
}

impl StageOutput for StrategyRecommendation {
    const NAME: &'static str = "strategy";
}

// === report ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Promising,
    Uncertain,
    Weak,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FinalReport {
    pub verdict: Verdict,
    /// Overall validation score, 0-100
    pub score: u8,
    pub executive_summary: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub next_steps: Vec<String>,
}

impl StageOutput for FinalReport {
    const NAME: &'static str = "report";

    fn check(&self) -> Result<(), String> {
        check_score("score", self.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_names_match_stage_names() {
        use crate::stages::StageName;
        let names = [
            NormalizedIdea::NAME,
            MarketResearch::NAME,
            MarketSizing::NAME,
            CompetitionScan::NAME,
            FeasibilityAssessment::NAME,
            StrategyRecommendation::NAME,
            FinalReport::NAME,
        ];
        for (stage, name) in StageName::ALL.iter().zip(names) {
            assert_eq!(stage.as_str(), name);
        }
    }

    #[test]
    fn test_schema_lists_required_fields() {
        let schema = OutputSchema::of::<NormalizedIdea>().schema();
        let required = schema["required"].as_array().expect("required list");
        assert!(required.contains(&json!("title")));
        assert!(required.contains(&json!("value_proposition")));
    }

    #[test]
    fn test_validate_fills_defaults() {
        let schema = OutputSchema::of::<NormalizedIdea>();
        let payload = schema
            .validate(json!({
                "title": "PetPal",
                "summary": "Dog walking marketplace",
                "problem": "Owners lack time",
                "target_customers": ["urban pet owners"],
                "value_proposition": "Vetted walkers on demand",
                "industry": "pet care"
            }))
            .unwrap();
        assert_eq!(payload["keywords"], json!([]));
    }

    #[test]
    fn test_validate_rejects_wrong_shape() {
        let schema = OutputSchema::of::<MarketResearch>();
        let err = schema.validate(json!({"overview": 42})).unwrap_err();
        assert!(err.contains("invalid type"));
    }

    #[test]
    fn test_semantic_checks() {
        let sizing = OutputSchema::of::<MarketSizing>();
        let err = sizing
            .validate(json!({
                "tam": {"value_usd": 10.0, "rationale": "x"},
                "sam": {"value_usd": 20.0, "rationale": "x"},
                "som": {"value_usd": 1.0, "rationale": "x"},
                "growth_rate_percent": 4.0
            }))
            .unwrap_err();
        assert!(err.contains("SOM <= SAM <= TAM"));

        let feasibility = OutputSchema::of::<FeasibilityAssessment>();
        let err = feasibility
            .validate(json!({
                "score": 140,
                "technical": "", "financial": "", "regulatory": "",
                "risks": []
            }))
            .unwrap_err();
        assert!(err.contains("between 0 and 100"));
    }
}
