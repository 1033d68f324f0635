//! # Stage Task
//!
//! Runs one stage against the inference client: renders the prompt, applies
//! the per-attempt timeout, retries provider failures with exponential
//! backoff, and makes at most one schema-guided repair when the response has
//! the wrong shape.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{prompts, StageName, StageSpec};
use crate::error::{ProviderError, StageError};
use crate::inference::{InferenceClient, InferenceParams, SchemaHint};
use crate::state::Job;

/// Output of a dependency as seen by a downstream stage
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyInput {
    Available(Value),
    /// The dependency failed; downstream gets a marker instead of data
    Unavailable,
}

/// Structured context handed to a stage
#[derive(Debug, Clone)]
pub struct StageInput {
    pub stage: StageName,
    pub idea_text: String,
    pub dependencies: BTreeMap<StageName, DependencyInput>,
}

impl StageInput {
    /// Build a stage's input from the job's current results
    pub fn from_job(job: &Job, spec: &StageSpec) -> Self {
        let dependencies = spec
            .depends_on
            .iter()
            .map(|dep| {
                let input = match job.stage_results.get(dep) {
                    Some(result) => match result.payload.data() {
                        Some(value) if result.succeeded => DependencyInput::Available(value.clone()),
                        _ => DependencyInput::Unavailable,
                    },
                    None => DependencyInput::Unavailable,
                };
                (*dep, input)
            })
            .collect();

        Self {
            stage: spec.name,
            idea_text: job.idea_text.clone(),
            dependencies,
        }
    }
}

/// Exponential backoff between provider retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Receives intermediate progress while a stage runs
#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn progressed(&self, stage: StageName, message: String);
}

/// Observer that discards progress
pub struct NoopObserver;

#[async_trait]
impl StageObserver for NoopObserver {
    async fn progressed(&self, _stage: StageName, _message: String) {}
}

/// Result of running a stage task
#[derive(Debug, Clone)]
pub struct StageRun {
    pub result: Result<Value, StageError>,
    /// Inference calls issued, repairs included
    pub attempts: u32,
}

enum AttemptFailure {
    Provider(ProviderError),
    Timeout,
}

/// One executable stage bound to a client
#[derive(Clone)]
pub struct StageTask {
    spec: StageSpec,
    client: Arc<dyn InferenceClient>,
    retry: RetryPolicy,
    observer: Arc<dyn StageObserver>,
}

impl StageTask {
    pub fn new(spec: StageSpec, client: Arc<dyn InferenceClient>, retry: RetryPolicy) -> Self {
        Self {
            spec,
            client,
            retry,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    #[tracing::instrument(skip(self, input), fields(stage = %self.spec.name))]
    pub async fn run(&self, input: &StageInput) -> StageRun {
        let stage = self.spec.name;
        let schema = SchemaHint::new(self.spec.output.name, self.spec.output.schema());
        let params = InferenceParams {
            model: self.spec.model.clone(),
            ..InferenceParams::default()
        };

        let base_prompt = prompts::render(input);
        let mut prompt = base_prompt.clone();
        let mut attempts = 0u32;
        let mut retries = 0u32;
        let mut repaired = false;

        loop {
            attempts += 1;
            tracing::debug!(attempt = attempts, "calling inference client");

            let call = tokio::time::timeout(
                self.spec.timeout,
                self.client.complete(&prompt, &schema, &params),
            )
            .await;

            let failure = match call {
                Ok(Ok(raw)) => match self.spec.output.validate(raw.clone()) {
                    Ok(payload) => {
                        return StageRun {
                            result: Ok(payload),
                            attempts,
                        }
                    }
                    Err(message) if !repaired => {
                        repaired = true;
                        tracing::debug!(%message, "schema mismatch, requesting repair");
                        self.observer
                            .progressed(
                                stage,
                                format!("Response did not match schema, requesting repair: {}", message),
                            )
                            .await;
                        prompt = prompts::render_repair(&base_prompt, &raw, &message, &schema.schema);
                        continue;
                    }
                    Err(message) => {
                        return StageRun {
                            result: Err(StageError::SchemaValidation {
                                schema: schema.name.clone(),
                                message,
                            }),
                            attempts,
                        }
                    }
                },
                Ok(Err(error)) => AttemptFailure::Provider(error),
                Err(_) => AttemptFailure::Timeout,
            };

            let retryable = match &failure {
                AttemptFailure::Provider(error) => error.is_retryable(),
                AttemptFailure::Timeout => true,
            };

            if !retryable || retries >= self.spec.retry_budget {
                let error = match failure {
                    AttemptFailure::Provider(source) => StageError::Provider { attempts, source },
                    AttemptFailure::Timeout => StageError::Timeout { attempts },
                };
                return StageRun {
                    result: Err(error),
                    attempts,
                };
            }

            let delay = self.retry.delay_for(retries);
            retries += 1;
            let reason = match &failure {
                AttemptFailure::Provider(error) => error.to_string(),
                AttemptFailure::Timeout => format!("timed out after {}s", self.spec.timeout.as_secs()),
            };
            tracing::debug!(%reason, retry = retries, ?delay, "retrying stage");
            self.observer
                .progressed(
                    stage,
                    format!(
                        "{}; retry {}/{} in {}ms",
                        reason,
                        retries,
                        self.spec.retry_budget,
                        delay.as_millis()
                    ),
                )
                .await;
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{CannedBehavior, CannedClient};
    use crate::stages::catalog;
    use crate::VentureConfig;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed sequence of responses
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<Value, ProviderError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<Value, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn complete(
            &self,
            prompt: &str,
            _schema: &SchemaHint,
            _params: &InferenceParams,
        ) -> Result<Value, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted")
        }
    }

    #[derive(Default)]
    struct RecordingObserver(Mutex<Vec<String>>);

    #[async_trait]
    impl StageObserver for RecordingObserver {
        async fn progressed(&self, _stage: StageName, message: String) {
            self.0.lock().unwrap().push(message);
        }
    }

    fn spec(stage: StageName) -> StageSpec {
        catalog(&VentureConfig::default())
            .into_iter()
            .find(|s| s.name == stage)
            .unwrap()
    }

    fn input(stage: StageName) -> StageInput {
        StageInput {
            stage,
            idea_text: "Dog walking on demand".to_string(),
            dependencies: BTreeMap::new(),
        }
    }

    fn valid_idea() -> Value {
        crate::inference::canned::fixture("normalize_idea")
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(valid_idea())]));
        let task = StageTask::new(spec(StageName::NormalizeIdea), client, RetryPolicy::default());

        let run = task.run(&input(StageName::NormalizeIdea)).await;
        assert_eq!(run.attempts, 1);
        assert_eq!(run.result.unwrap()["title"], "PetPal");
    }

    #[tokio::test]
    async fn test_single_repair_recovers() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(json!({"title": 7})),
            Ok(valid_idea()),
        ]));
        let observer = Arc::new(RecordingObserver::default());
        let task = StageTask::new(spec(StageName::NormalizeIdea), client.clone(), RetryPolicy::default())
            .with_observer(observer.clone());

        let run = task.run(&input(StageName::NormalizeIdea)).await;
        assert!(run.result.is_ok());
        assert_eq!(run.attempts, 2);

        let prompts = client.prompts.lock().unwrap();
        assert!(prompts[1].contains("Correction required"));
        assert!(observer.0.lock().unwrap()[0].contains("requesting repair"));
    }

    #[tokio::test]
    async fn test_second_mismatch_is_schema_error() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(json!({"unexpected": true})),
            Ok(json!({"unexpected": true})),
        ]));
        let task = StageTask::new(spec(StageName::NormalizeIdea), client, RetryPolicy::default());

        let run = task.run(&input(StageName::NormalizeIdea)).await;
        assert_eq!(run.attempts, 2);
        assert!(matches!(
            run.result,
            Err(StageError::SchemaValidation { ref schema, .. }) if schema == "normalize_idea"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_errors_retry_with_backoff() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ProviderError::RateLimited),
            Err(ProviderError::Transport("reset".into())),
            Ok(valid_idea()),
        ]));
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        };
        let task = StageTask::new(spec(StageName::NormalizeIdea), client, policy);

        let started = tokio::time::Instant::now();
        let run = task.run(&input(StageName::NormalizeIdea)).await;
        assert!(run.result.is_ok());
        assert_eq!(run.attempts, 3);
        // 100ms + 200ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let client = Arc::new(CannedClient::new().with_behavior(
            "market_research",
            CannedBehavior::ProviderFailure,
        ));
        let stage = spec(StageName::MarketResearch);
        let budget = stage.retry_budget;
        let task = StageTask::new(stage, client.clone(), RetryPolicy::default());

        let run = task.run(&input(StageName::MarketResearch)).await;
        assert_eq!(run.attempts, budget + 1);
        assert_eq!(client.calls("market_research"), budget + 1);
        assert!(matches!(run.result, Err(StageError::Provider { .. })));
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![Err(ProviderError::Auth(
            "OPENAI_API_KEY is not set".into(),
        ))]));
        let task = StageTask::new(spec(StageName::NormalizeIdea), client, RetryPolicy::default());

        let run = task.run(&input(StageName::NormalizeIdea)).await;
        assert_eq!(run.attempts, 1);
        assert!(matches!(
            run.result,
            Err(StageError::Provider { source: ProviderError::Auth(_), .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_become_timeout_error() {
        let client = Arc::new(CannedClient::new().with_behavior("feasibility", CannedBehavior::Hang));
        let mut stage = spec(StageName::Feasibility);
        stage.retry_budget = 1;
        let task = StageTask::new(stage, client, RetryPolicy::default());

        let run = task.run(&input(StageName::Feasibility)).await;
        assert_eq!(run.result.unwrap_err(), StageError::Timeout { attempts: 2 });
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }
}
