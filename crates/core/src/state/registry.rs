//! # Job Registry
//!
//! Single source of truth for every job. Writes for one job are serialized
//! through that job's async mutex, committed to the durable store with an
//! expected-revision check, and then published as an immutable snapshot.
//! Readers never take the writer lock.
//!
//! ```text
//! writer ──lock──▶ mutate clone ──▶ JobStore::update(rev) ──▶ watch::send(Arc<Job>)
//! reader ─────────────────────────────────────────────────▶ watch::borrow()
//! ```

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::job::{Job, JobOutcome, StageResult};
use super::store::{JobStore, MemoryJobStore};
use crate::error::{JobFailure, RegistryError, StoreError};
use crate::pipeline::events::JobEvent;
use crate::stages::StageName;

/// Attempts at rebasing a write after a revision conflict
const MAX_REBASE_ATTEMPTS: usize = 3;

struct SlotState {
    job: Job,
    events: Vec<JobEvent>,
    terminal_emitted: bool,
}

/// Hot-set entry for one job
struct JobSlot {
    writer: Mutex<SlotState>,
    snapshot: watch::Sender<Arc<Job>>,
}

impl JobSlot {
    fn new(job: Job) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(job.clone()));
        Self {
            writer: Mutex::new(SlotState {
                job,
                events: Vec::new(),
                terminal_emitted: false,
            }),
            snapshot,
        }
    }
}

/// Registry of in-flight and recently finished jobs
pub struct JobRegistry {
    slots: RwLock<HashMap<String, Arc<JobSlot>>>,
    store: Arc<dyn JobStore>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Registry over a process-local store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryJobStore::new()))
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    async fn slot(&self, job_id: &str) -> Option<Arc<JobSlot>> {
        self.slots.read().await.get(job_id).cloned()
    }

    /// Register a new Pending job
    pub async fn create(&self, job_id: &str, idea_text: &str) -> Result<Arc<Job>, RegistryError> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(job_id) {
            return Err(RegistryError::AlreadyExists(job_id.to_string()));
        }

        let job = Job::new(job_id, idea_text);
        match self.store.insert(&job) {
            Ok(()) => {}
            Err(StoreError::Duplicate(id)) => return Err(RegistryError::AlreadyExists(id)),
            Err(e) => return Err(e.into()),
        }

        let slot = Arc::new(JobSlot::new(job));
        let snapshot = slot.snapshot.borrow().clone();
        slots.insert(job_id.to_string(), slot);
        tracing::debug!(job_id, "job registered");
        Ok(snapshot)
    }

    /// Current snapshot, from the hot set or the durable store
    pub async fn get(&self, job_id: &str) -> Result<Arc<Job>, RegistryError> {
        if let Some(slot) = self.slot(job_id).await {
            return Ok(slot.snapshot.borrow().clone());
        }
        self.store
            .load(job_id)?
            .map(Arc::new)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))
    }

    /// Watch a hot job's snapshots
    pub async fn watch(&self, job_id: &str) -> Option<watch::Receiver<Arc<Job>>> {
        self.slot(job_id).await.map(|slot| slot.snapshot.subscribe())
    }

    pub async fn start_stage(&self, job_id: &str, stage: StageName) -> Result<Arc<Job>, RegistryError> {
        self.mutate(job_id, |job| job.start_stage(stage)).await
    }

    pub async fn apply_stage_result(
        &self,
        job_id: &str,
        stage: StageName,
        result: StageResult,
    ) -> Result<Arc<Job>, RegistryError> {
        self.mutate(job_id, |job| job.apply_stage_result(stage, result.clone()))
            .await
    }

    pub async fn finalize(&self, job_id: &str, outcome: JobOutcome) -> Result<Arc<Job>, RegistryError> {
        let job = self
            .mutate(job_id, |job| job.finalize(outcome.clone()))
            .await?;
        tracing::info!(job_id, status = %job.status, "job finalized");
        Ok(job)
    }

    /// Finalize in the hot set even if the store refuses the write.
    ///
    /// The terminal snapshot is published regardless; an unpersisted job
    /// stays hot until the retention window passes.
    pub async fn force_finalize(
        &self,
        job_id: &str,
        outcome: JobOutcome,
    ) -> Result<Arc<Job>, RegistryError> {
        let slot = self
            .slot(job_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;
        let mut state = slot.writer.lock().await;

        let mut next = state.job.clone();
        next.finalize(outcome)?;
        next.revision = state.job.revision + 1;
        next.updated_at = Utc::now();
        if let Err(e) = self.store.update(&next, state.job.revision) {
            tracing::error!(job_id, error = %e, "terminal status kept in memory only");
        }

        state.job = next.clone();
        let snapshot = Arc::new(next);
        slot.snapshot.send_replace(Arc::clone(&snapshot));
        tracing::info!(job_id, status = %snapshot.status, "job force-finalized");
        Ok(snapshot)
    }

    /// Serialize `apply` against other writers, commit, then publish
    async fn mutate<F>(&self, job_id: &str, mut apply: F) -> Result<Arc<Job>, RegistryError>
    where
        F: FnMut(&mut Job) -> Result<(), RegistryError>,
    {
        let slot = self
            .slot(job_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;
        let mut state = slot.writer.lock().await;

        let mut next = state.job.clone();
        apply(&mut next)?;
        next.revision = state.job.revision + 1;
        next.updated_at = Utc::now();

        match self.store.update(&next, state.job.revision) {
            Ok(()) => {}
            Err(StoreError::Conflict {
                expected, found, ..
            }) => {
                tracing::warn!(job_id, expected, found, "registry write conflict, rebasing on stored revision");
                next = self.rebase(job_id, &mut apply)?;
            }
            Err(e) => return Err(e.into()),
        }

        state.job = next.clone();
        let snapshot = Arc::new(next);
        slot.snapshot.send_replace(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Re-apply a write on top of whatever the store holds
    fn rebase<F>(&self, job_id: &str, apply: &mut F) -> Result<Job, RegistryError>
    where
        F: FnMut(&mut Job) -> Result<(), RegistryError>,
    {
        let mut last_conflict = None;
        for _ in 0..MAX_REBASE_ATTEMPTS {
            let stored = self
                .store
                .load(job_id)?
                .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;

            let mut next = stored.clone();
            apply(&mut next)?;
            next.revision = stored.revision + 1;
            next.updated_at = Utc::now();

            match self.store.update(&next, stored.revision) {
                Ok(()) => return Ok(next),
                Err(conflict @ StoreError::Conflict { .. }) => {
                    tracing::warn!(job_id, "rebase lost another race");
                    last_conflict = Some(conflict);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_conflict
            .unwrap_or_else(|| StoreError::Missing(job_id.to_string()))
            .into())
    }

    /// Append to the job's event log, assigning the next sequence number.
    /// Nothing is accepted after the terminal event. A store failure is
    /// logged; the hot log still records the event so live viewers see it.
    pub async fn append_event(&self, mut event: JobEvent) -> Result<JobEvent, RegistryError> {
        let slot = self
            .slot(&event.job_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(event.job_id.clone()))?;
        let mut state = slot.writer.lock().await;

        if state.terminal_emitted {
            return Err(RegistryError::DuplicateTerminal(event.job_id));
        }

        event.sequence = state.events.len() as u64 + 1;
        if let Err(e) = self.store.append_event(&event) {
            tracing::error!(job_id = %event.job_id, error = %e, "event kept in memory only");
        }
        state.terminal_emitted = event.is_terminal();
        state.events.push(event.clone());
        Ok(event)
    }

    /// Recorded event log
    pub async fn events(&self, job_id: &str) -> Result<Vec<JobEvent>, RegistryError> {
        if let Some(slot) = self.slot(job_id).await {
            return Ok(slot.writer.lock().await.events.clone());
        }
        if self.store.load(job_id)?.is_none() {
            return Err(RegistryError::NotFound(job_id.to_string()));
        }
        Ok(self.store.events(job_id)?)
    }

    /// Drop a job from the hot set; it stays readable from the store
    pub async fn retire(&self, job_id: &str) -> bool {
        let retired = self.slots.write().await.remove(job_id).is_some();
        if retired {
            tracing::debug!(job_id, "job retired from hot set");
        }
        retired
    }

    /// Jobs currently in the hot set
    pub async fn active_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Delete terminal jobs older than `retention` from the durable store
    pub async fn evict_expired(&self, retention: Duration) -> Result<usize, RegistryError> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let mut evicted = self.store.delete_completed_before(cutoff)?;

        let mut slots = self.slots.write().await;
        for id in &evicted {
            slots.remove(id);
        }
        // Terminal jobs the store never learned about
        slots.retain(|id, slot| {
            let job = slot.snapshot.borrow();
            let expired = job.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff);
            if expired {
                evicted.push(id.clone());
            }
            !expired
        });
        drop(slots);

        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicted expired jobs");
        }
        Ok(evicted.len())
    }

    /// Fail every job a previous process left unfinished
    pub async fn recover_interrupted(&self) -> Result<usize, RegistryError> {
        let unfinished = self.store.unfinished()?;
        let mut recovered = 0;

        for stored in unfinished {
            if self.slot(&stored.id).await.is_some() {
                continue;
            }
            let mut job = stored.clone();
            job.finalize(JobOutcome::Failed(JobFailure::Interrupted))?;
            job.revision = stored.revision + 1;
            job.updated_at = Utc::now();
            self.store.update(&job, stored.revision)?;

            let mut event = JobEvent::terminal_from(&job)
                .unwrap_or_else(|| JobEvent::job_failed(&job.id, &JobFailure::Interrupted));
            event.sequence = self.store.events(&job.id)?.len() as u64 + 1;
            self.store.append_event(&event)?;

            tracing::warn!(job_id = %job.id, "job interrupted by restart marked failed");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Periodically evict expired jobs
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, retention: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.evict_expired(retention).await {
                    tracing::warn!(error = %e, "job sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{JobStatus, SqliteJobStore, VentureDb};
    use chrono::DateTime;
    use serde_json::json;

    /// Accepts inserts, refuses every later write
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryJobStore,
    }

    impl JobStore for ReadOnlyStore {
        fn insert(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.insert(job)
        }

        fn update(&self, _job: &Job, _expected_revision: u64) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }

        fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
            self.inner.load(job_id)
        }

        fn unfinished(&self) -> Result<Vec<Job>, StoreError> {
            self.inner.unfinished()
        }

        fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
            self.inner.delete_completed_before(cutoff)
        }

        fn append_event(&self, _event: &JobEvent) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }

        fn events(&self, job_id: &str) -> Result<Vec<JobEvent>, StoreError> {
            self.inner.events(job_id)
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let registry = JobRegistry::in_memory();
        registry.create("a", "idea").await.unwrap();
        assert!(matches!(
            registry.create("a", "again").await,
            Err(RegistryError::AlreadyExists(_))
        ));

        // Still rejected once retired, since the store has it
        registry.retire("a").await;
        assert!(matches!(
            registry.create("a", "again").await,
            Err(RegistryError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let registry = JobRegistry::in_memory();
        assert!(matches!(
            registry.get("nope").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_bump_revision_and_publish() {
        let registry = JobRegistry::in_memory();
        registry.create("a", "idea").await.unwrap();
        let mut rx = registry.watch("a").await.unwrap();

        let job = registry.start_stage("a", StageName::NormalizeIdea).await.unwrap();
        assert_eq!(job.revision, 1);
        assert_eq!(job.status, JobStatus::Running);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().revision, 1);

        registry
            .apply_stage_result("a", StageName::NormalizeIdea, StageResult::success(json!({"t": 1}), 1))
            .await
            .unwrap();
        let stored = registry.store().load("a").unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(*registry.get("a").await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_finalize_twice_rejected() {
        let registry = JobRegistry::in_memory();
        registry.create("a", "idea").await.unwrap();
        registry.finalize("a", JobOutcome::Completed).await.unwrap();
        assert!(matches!(
            registry.finalize("a", JobOutcome::Completed).await,
            Err(RegistryError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_conflict_rebases_on_store() {
        let store = Arc::new(MemoryJobStore::new());
        let registry = JobRegistry::new(store.clone());
        registry.create("a", "idea").await.unwrap();

        // Another writer bumps the stored record behind the registry's back
        let mut foreign = store.load("a").unwrap().unwrap();
        foreign.apply_stage_result(StageName::NormalizeIdea, StageResult::success(json!({"t": 1}), 1))
            .unwrap();
        foreign.revision = 5;
        store.update(&foreign, 0).unwrap();

        let job = registry
            .apply_stage_result("a", StageName::MarketResearch, StageResult::failure("x", 1))
            .await
            .unwrap();
        assert_eq!(job.revision, 6);
        assert_eq!(job.stage_results.len(), 2);
        assert_eq!(store.load("a").unwrap().unwrap().revision, 6);
    }

    #[tokio::test]
    async fn test_event_log_rejects_second_terminal() {
        let registry = JobRegistry::in_memory();
        registry.create("a", "idea").await.unwrap();

        let first = registry.append_event(JobEvent::job_started("a")).await.unwrap();
        assert_eq!(first.sequence, 1);
        let done = registry.append_event(JobEvent::job_completed("a")).await.unwrap();
        assert_eq!(done.sequence, 2);

        assert!(matches!(
            registry.append_event(JobEvent::job_failed("a", &JobFailure::Interrupted)).await,
            Err(RegistryError::DuplicateTerminal(_))
        ));
        assert_eq!(registry.events("a").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retired_jobs_read_from_store() {
        let registry = JobRegistry::in_memory();
        registry.create("a", "idea").await.unwrap();
        registry.append_event(JobEvent::job_started("a")).await.unwrap();
        registry.finalize("a", JobOutcome::Completed).await.unwrap();

        assert!(registry.retire("a").await);
        assert_eq!(registry.active_count().await, 0);

        let job = registry.get("a").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(registry.events("a").await.unwrap().len(), 1);
        assert!(registry.watch("a").await.is_none());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let registry = JobRegistry::in_memory();
        registry.create("old", "idea").await.unwrap();
        registry.finalize("old", JobOutcome::Completed).await.unwrap();
        registry.create("live", "idea").await.unwrap();

        assert_eq!(registry.evict_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.evict_expired(Duration::ZERO).await.unwrap(), 1);
        assert!(matches!(
            registry.get("old").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.get("live").await.is_ok());
    }

    #[tokio::test]
    async fn test_recover_interrupted_jobs() {
        let db = VentureDb::open_in_memory().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(&db));

        // A previous process left a running job behind
        let previous = JobRegistry::new(store.clone());
        previous.create("stale", "idea").await.unwrap();
        previous.start_stage("stale", StageName::MarketResearch).await.unwrap();
        drop(previous);

        let registry = JobRegistry::new(store);
        assert_eq!(registry.recover_interrupted().await.unwrap(), 1);

        let job = registry.get("stale").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.terminal_error, Some(JobFailure::Interrupted));
        let events = registry.events("stale").await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());

        assert_eq!(registry.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refused_writes_keep_terminal_state_hot() {
        let registry = JobRegistry::new(Arc::new(ReadOnlyStore::default()));
        registry.create("a", "idea").await.unwrap();

        assert!(matches!(
            registry.start_stage("a", StageName::NormalizeIdea).await,
            Err(RegistryError::Store(StoreError::Poisoned))
        ));

        let started = registry.append_event(JobEvent::job_started("a")).await.unwrap();
        assert_eq!(started.sequence, 1);

        let job = registry
            .force_finalize("a", JobOutcome::Failed(JobFailure::Interrupted))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(registry.get("a").await.unwrap().status, JobStatus::Failed);

        let done = registry.append_event(JobEvent::terminal_from(&job).unwrap()).await.unwrap();
        assert_eq!(done.sequence, 2);
        assert_eq!(registry.events("a").await.unwrap().len(), 2);

        // The sweeper still clears it from the hot set
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.evict_expired(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(registry.active_count().await, 0);
    }
}
