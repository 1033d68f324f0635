//! # Canned Backend
//!
//! Deterministic offline inference backend. Answers every stage schema with
//! a fixture payload, and can be told to misbehave per schema. Powers
//! `venture serve --offline` and the pipeline tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{InferenceClient, InferenceParams, SchemaHint};
use crate::error::ProviderError;

/// How the canned backend answers a given schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CannedBehavior {
    /// Return the fixture payload
    Respond,
    /// Return well-formed JSON with the wrong shape
    Malformed,
    /// Never answer
    Hang,
    /// Fail with a retryable provider error
    ProviderFailure,
    /// Fail with a retryable provider error `n` times, then respond
    FailThenRespond(u32),
}

/// Offline backend with per-schema behavior and call accounting
pub struct CannedClient {
    behaviors: Mutex<HashMap<String, CannedBehavior>>,
    calls: Mutex<HashMap<String, u32>>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for CannedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CannedClient {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Simulated response latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set the behavior for one schema name
    pub fn with_behavior(self, schema: &str, behavior: CannedBehavior) -> Self {
        self.set_behavior(schema, behavior);
        self
    }

    pub fn set_behavior(&self, schema: &str, behavior: CannedBehavior) {
        if let Ok(mut behaviors) = self.behaviors.lock() {
            behaviors.insert(schema.to_string(), behavior);
        }
    }

    /// Calls received for a schema name
    pub fn calls(&self, schema: &str) -> u32 {
        self.calls
            .lock()
            .map(|calls| calls.get(schema).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls
            .lock()
            .map(|calls| calls.values().sum())
            .unwrap_or(0)
    }

    /// Highest number of simultaneously unresolved calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record_call(&self, schema: &str) -> u32 {
        let mut calls = match self.calls.lock() {
            Ok(calls) => calls,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = calls.entry(schema.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn behavior(&self, schema: &str) -> CannedBehavior {
        self.behaviors
            .lock()
            .ok()
            .and_then(|b| b.get(schema).cloned())
            .unwrap_or(CannedBehavior::Respond)
    }
}

/// Decrements the in-flight counter when a call resolves or is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceClient for CannedClient {
    async fn complete(
        &self,
        _prompt: &str,
        schema: &SchemaHint,
        _params: &InferenceParams,
    ) -> Result<Value, ProviderError> {
        let call_number = self.record_call(&schema.name);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.behavior(&schema.name) {
            CannedBehavior::Respond => Ok(fixture(&schema.name)),
            CannedBehavior::Malformed => Ok(json!({ "unexpected": true })),
            CannedBehavior::Hang => std::future::pending().await,
            CannedBehavior::ProviderFailure => Err(ProviderError::Http {
                status: 503,
                body: "canned outage".to_string(),
            }),
            CannedBehavior::FailThenRespond(failures) if call_number <= failures => {
                Err(ProviderError::RateLimited)
            }
            CannedBehavior::FailThenRespond(_) => Ok(fixture(&schema.name)),
        }
    }
}

/// Fixture payload for a stage schema
pub fn fixture(schema: &str) -> Value {
    match schema {
        "normalize_idea" => json!({
            "title": "PetPal",
            "summary": "An on-demand marketplace connecting busy pet owners with vetted local dog walkers.",
            "problem": "Urban pet owners struggle to find reliable walkers at short notice.",
            "target_customers": ["urban professionals with dogs", "elderly pet owners"],
            "value_proposition": "Background-checked walkers bookable within an hour.",
            "industry": "pet care services",
            "keywords": ["dog walking", "pet care", "marketplace"]
        }),
        "market_research" => json!({
            "overview": "Pet care spending keeps growing as pet ownership rises in cities.",
            "trends": [
                {"name": "Pet humanization", "description": "Owners treat pets as family.", "impact": "positive"},
                {"name": "Gig platform fatigue", "description": "Trust concerns with gig workers.", "impact": "negative"}
            ],
            "segments": [
                {"name": "Urban professionals", "needs": ["reliability", "flexible booking"], "size_hint": "large"}
            ],
            "sources": ["industry association survey"]
        }),
        "market_sizing" => json!({
            "tam": {"value_usd": 1.2e9, "rationale": "US dog walking services spend."},
            "sam": {"value_usd": 3.0e8, "rationale": "Top 20 metro areas."},
            "som": {"value_usd": 1.5e7, "rationale": "5% share of SAM in five years."},
            "growth_rate_percent": 6.5,
            "assumptions": ["Pet ownership grows with household formation"]
        }),
        "competition" => json!({
            "competitors": [
                {
                    "name": "Rover",
                    "description": "Marketplace for pet sitting and walking.",
                    "strengths": ["brand recognition"],
                    "weaknesses": ["inconsistent walker quality"],
                    "website": "https://www.rover.com"
                }
            ],
            "saturation": "medium",
            "differentiation": "Same-hour availability with stricter vetting."
        }),
        "feasibility" => json!({
            "score": 72,
            "technical": "Standard two-sided marketplace stack.",
            "financial": "Low capital needs; margins depend on take rate.",
            "regulatory": "Local licensing and insurance requirements apply.",
            "risks": [
                {"description": "Walker liability incidents", "severity": "high", "mitigation": "Mandatory insurance coverage"}
            ]
        }),
        "strategy" => json!({
            "positioning": "The most trusted last-minute dog walking service in the city.",
            "go_to_market": ["partner with vet clinics", "local social ads"],
            "pricing": "Per-walk pricing with a subscription discount.",
            "milestones": [
                {"title": "Launch in one metro", "timeframe": "3 months"},
                {"title": "Expand to three metros", "timeframe": "12 months"}
            ]
        }),
        "report" => json!({
            "verdict": "promising",
            "score": 68,
            "executive_summary": "A crowded but growing market where trust is the wedge.",
            "strengths": ["clear pain point", "growing market"],
            "weaknesses": ["strong incumbents"],
            "next_steps": ["interview 20 pet owners", "recruit 10 pilot walkers"]
        }),
        other => json!({ "note": format!("no fixture for {}", other) }),
    }
}
