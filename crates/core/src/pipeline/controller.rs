//! # Pipeline Controller
//!
//! Drives one job through the stage plan: builds each stage's input from
//! the registry snapshot, runs the stage task, merges the result, publishes
//! events, and applies the partial-failure policy. The whole stage loop runs
//! under the job's time budget.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

use super::aggregate::aggregate;
use super::broadcaster::EventBroadcaster;
use super::events::JobEvent;
use super::machine::{Decision, ExecutionPlan, JobMachine, StageOutcome};
use crate::config::VentureConfig;
use crate::error::{JobFailure, PlanError, ProviderError, RegistryError, StageError, SubmitError};
use crate::inference::{InferenceClient, LimitedClient};
use crate::stages::{
    catalog, RetryPolicy, StageInput, StageName, StageObserver, StageRun, StageSpec, StageTask,
};
use crate::state::{IdeaStorage, Job, JobOutcome, JobRegistry, StageResult};

/// Publishes progress straight to live subscribers
struct LiveObserver {
    job_id: String,
    broadcaster: Arc<EventBroadcaster>,
}

#[async_trait::async_trait]
impl StageObserver for LiveObserver {
    async fn progressed(&self, stage: StageName, message: String) {
        let event = JobEvent::stage_progressed(&self.job_id, stage, message);
        if let Err(e) = self.broadcaster.publish(event).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to publish progress");
        }
    }
}

/// Holds progress until a concurrent wave resolves
struct BufferedObserver {
    job_id: String,
    events: Mutex<Vec<JobEvent>>,
}

impl BufferedObserver {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl StageObserver for BufferedObserver {
    async fn progressed(&self, stage: StageName, message: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(JobEvent::stage_progressed(&self.job_id, stage, message));
        }
    }
}

/// Runs validation jobs
#[derive(Clone)]
pub struct PipelineController {
    registry: Arc<JobRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    client: Arc<dyn InferenceClient>,
    storage: Arc<dyn IdeaStorage>,
    plan: Arc<ExecutionPlan>,
    retry: RetryPolicy,
    job_timeout: Duration,
    max_idea_chars: usize,
}

impl PipelineController {
    /// Build a controller. `client` is wrapped in the process-wide
    /// concurrency limiter sized from config.
    pub fn new(
        config: &VentureConfig,
        registry: Arc<JobRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        client: Arc<dyn InferenceClient>,
        storage: Arc<dyn IdeaStorage>,
    ) -> Result<Self, PlanError> {
        let specs = catalog(config);
        let plan = if config.parallel_stages {
            ExecutionPlan::parallel(specs)?
        } else {
            ExecutionPlan::sequential(specs)?
        };
        let client: Arc<dyn InferenceClient> =
            Arc::new(LimitedClient::new(client, config.max_concurrent_inference));

        Ok(Self {
            registry,
            broadcaster,
            client,
            storage,
            plan: Arc::new(plan),
            retry: config.retry_policy(),
            job_timeout: config.job_timeout(),
            max_idea_chars: config.max_idea_chars,
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    fn validate(&self, idea_text: &str) -> Result<(), SubmitError> {
        if idea_text.trim().is_empty() {
            return Err(SubmitError::EmptyIdea);
        }
        if idea_text.chars().count() > self.max_idea_chars {
            return Err(SubmitError::TooLong {
                max: self.max_idea_chars,
            });
        }
        Ok(())
    }

    async fn create(&self, job_id: &str, idea_text: &str) -> Result<(), SubmitError> {
        self.validate(idea_text)?;
        self.registry.create(job_id, idea_text).await?;
        self.broadcaster.open(job_id);
        Ok(())
    }

    /// Accept an idea and start its job in the background.
    ///
    /// The job is registered before this returns, so it is immediately
    /// pollable.
    pub async fn submit(&self, idea_text: &str) -> Result<String, SubmitError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        self.create(&job_id, idea_text).await?;

        let controller = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.drive(&id).await {
                tracing::error!(job_id = %id, error = %e, "job driver failed");
            }
        });

        tracing::info!(%job_id, "job submitted");
        Ok(job_id)
    }

    /// Create a job and drive it to completion in the current task
    pub async fn run(&self, idea_text: &str, job_id: &str) -> Result<Arc<Job>, SubmitError> {
        self.create(job_id, idea_text).await?;
        Ok(self.drive(job_id).await?)
    }

    /// Drive a registered job to a terminal status
    #[tracing::instrument(skip(self), fields(idea_preview = tracing::field::Empty))]
    pub async fn drive(&self, job_id: &str) -> Result<Arc<Job>, RegistryError> {
        let job = self.registry.get(job_id).await?;
        tracing::Span::current().record(
            "idea_preview",
            job.idea_text.chars().take(50).collect::<String>().as_str(),
        );
        tracing::info!("job started");
        self.publish(JobEvent::job_started(job_id)).await;

        let outcome = match tokio::time::timeout(self.job_timeout, self.run_stages(job_id)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "stage loop aborted");
                JobOutcome::Failed(JobFailure::Internal {
                    message: e.to_string(),
                })
            }
            Err(_) => {
                let after_secs = self.job_timeout.as_secs();
                tracing::warn!(after_secs, "job exceeded its time budget");
                JobOutcome::Failed(JobFailure::JobTimeout { after_secs })
            }
        };

        let (job, durable) = match self.registry.finalize(job_id, outcome.clone()).await {
            Ok(job) => (job, true),
            Err(e) => {
                tracing::error!(error = %e, "could not persist terminal status");
                (self.registry.force_finalize(job_id, outcome).await?, false)
            }
        };
        if let Some(terminal) = JobEvent::terminal_from(&job) {
            self.publish(terminal).await;
        }

        let report = aggregate(&job);
        if let Err(e) = self.storage.save(job_id, &report).await {
            tracing::warn!(error = %e, "failed to hand report to idea storage");
        }
        // The store may still show the job unfinished; keep serving it hot
        if durable {
            self.registry.retire(job_id).await;
        }

        Ok(job)
    }

    async fn publish(&self, event: JobEvent) {
        if let Err(e) = self.broadcaster.publish(event).await {
            tracing::warn!(error = %e, "failed to publish event");
        }
    }

    async fn run_stages(&self, job_id: &str) -> Result<JobOutcome, RegistryError> {
        let mut machine = JobMachine::new();

        for wave in self.plan.waves() {
            let decision = match wave.as_slice() {
                [spec] => self.run_stage(job_id, spec, &mut machine).await?,
                specs => self.run_wave(job_id, specs, &mut machine).await?,
            };
            if let Some(failure) = decision {
                return Ok(JobOutcome::Failed(failure));
            }
        }

        machine.finish();
        Ok(JobOutcome::Completed)
    }

    /// Run one stage, publishing as it goes
    async fn run_stage(
        &self,
        job_id: &str,
        spec: &StageSpec,
        machine: &mut JobMachine,
    ) -> Result<Option<JobFailure>, RegistryError> {
        machine.begin(spec.name);
        let job = self.registry.start_stage(job_id, spec.name).await?;
        self.publish(JobEvent::stage_started(job_id, spec.name)).await;

        let input = StageInput::from_job(&job, spec);
        let observer = Arc::new(LiveObserver {
            job_id: job_id.to_string(),
            broadcaster: Arc::clone(&self.broadcaster),
        });
        let run = StageTask::new(spec.clone(), Arc::clone(&self.client), self.retry)
            .with_observer(observer)
            .run(&input)
            .await;

        self.settle(job_id, spec, run, machine).await
    }

    /// Run a wave concurrently, then merge and publish in ordinal order
    async fn run_wave(
        &self,
        job_id: &str,
        specs: &[StageSpec],
        machine: &mut JobMachine,
    ) -> Result<Option<JobFailure>, RegistryError> {
        let before = self.registry.get(job_id).await?;
        let mut started = BTreeMap::new();
        for spec in specs {
            machine.begin(spec.name);
            self.registry.start_stage(job_id, spec.name).await?;
            started.insert(spec.name, JobEvent::stage_started(job_id, spec.name));
        }

        let mut join_set = JoinSet::new();
        for spec in specs {
            let input = StageInput::from_job(&before, spec);
            let observer = Arc::new(BufferedObserver::new(job_id));
            let task = StageTask::new(spec.clone(), Arc::clone(&self.client), self.retry)
                .with_observer(observer.clone());
            join_set.spawn(async move {
                let run = task.run(&input).await;
                (task.spec().name, run, observer)
            });
        }

        let mut finished = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, run, observer)) => {
                    finished.insert(name, (run, observer.take()));
                }
                Err(e) => tracing::warn!(error = %e, "stage task panicked"),
            }
        }

        for spec in specs {
            if let Some(event) = started.remove(&spec.name) {
                self.publish(event).await;
            }
            let run = match finished.remove(&spec.name) {
                Some((run, progress)) => {
                    for event in progress {
                        self.publish(event).await;
                    }
                    run
                }
                None => StageRun {
                    result: Err(StageError::Provider {
                        attempts: 0,
                        source: ProviderError::Transport("stage task panicked".to_string()),
                    }),
                    attempts: 0,
                },
            };
            if let Some(failure) = self.settle(job_id, spec, run, machine).await? {
                return Ok(Some(failure));
            }
        }
        Ok(None)
    }

    /// Merge a stage's result and apply the failure policy
    async fn settle(
        &self,
        job_id: &str,
        spec: &StageSpec,
        run: StageRun,
        machine: &mut JobMachine,
    ) -> Result<Option<JobFailure>, RegistryError> {
        let stage = spec.name;
        match run.result {
            Ok(payload) => {
                let event = JobEvent::stage_completed(job_id, stage, &payload);
                self.record(job_id, stage, payload, run.attempts).await?;
                self.publish(event).await;
                machine.record(spec, StageOutcome::Succeeded);
                Ok(None)
            }
            Err(error) => {
                let message = error.to_string();
                self.registry
                    .apply_stage_result(job_id, stage, StageResult::failure(&message, run.attempts))
                    .await?;
                self.publish(JobEvent::stage_failed(job_id, stage, &message))
                    .await;

                match machine.record(spec, StageOutcome::Failed) {
                    Decision::Continue => {
                        tracing::warn!(%stage, error = %message, "best-effort stage failed, continuing");
                        Ok(None)
                    }
                    Decision::Abort => {
                        tracing::warn!(%stage, error = %message, "critical stage failed, aborting job");
                        Ok(Some(JobFailure::CriticalStageFailure { stage, message }))
                    }
                }
            }
        }
    }

    async fn record(
        &self,
        job_id: &str,
        stage: StageName,
        payload: Value,
        attempts: u32,
    ) -> Result<(), RegistryError> {
        self.registry
            .apply_stage_result(job_id, stage, StageResult::success(payload, attempts))
            .await?;
        Ok(())
    }
}
