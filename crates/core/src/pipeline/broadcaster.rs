//! # Event Broadcaster
//!
//! Fans job events out to live subscribers over one `tokio::sync::broadcast`
//! channel per job. The registry's event log and snapshot stay
//! authoritative: a subscriber that arrives late, or falls behind, recovers
//! from the registry rather than from replayed history.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::events::JobEvent;
use crate::error::RegistryError;
use crate::stages::StageName;
use crate::state::JobRegistry;

/// Live events for one job, ending after its terminal event
pub type EventStream = BoxStream<'static, JobEvent>;

pub struct EventBroadcaster {
    registry: Arc<JobRegistry>,
    channels: Mutex<HashMap<String, broadcast::Sender<JobEvent>>>,
    capacity: usize,
}

impl EventBroadcaster {
    pub fn new(registry: Arc<JobRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<JobEvent>>> {
        match self.channels.lock() {
            Ok(channels) => channels,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sender(&self, job_id: &str) -> broadcast::Sender<JobEvent> {
        self.channels()
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Create the live channel for a new job
    pub fn open(&self, job_id: &str) {
        self.sender(job_id);
    }

    /// Jobs with an open live channel
    pub fn open_channels(&self) -> usize {
        self.channels().len()
    }

    /// Record an event in the job's log, then forward it to live subscribers
    pub async fn publish(&self, event: JobEvent) -> Result<JobEvent, RegistryError> {
        let event = match self.registry.append_event(event).await {
            Ok(event) => event,
            Err(RegistryError::DuplicateTerminal(job_id)) => {
                tracing::warn!(%job_id, "dropping event published after the terminal event");
                return Err(RegistryError::DuplicateTerminal(job_id));
            }
            Err(e) => return Err(e),
        };

        let sender = self.channels().get(&event.job_id).cloned();
        if let Some(tx) = sender {
            // No receivers is fine; the log has the event
            let _ = tx.send(event.clone());
        }

        if event.is_terminal() {
            self.channels().remove(&event.job_id);
            tracing::debug!(job_id = %event.job_id, "event channel closed");
        }
        Ok(event)
    }

    /// Subscribe to a job's live events.
    ///
    /// A job that is already terminal yields exactly one synthetic terminal
    /// event. Unknown jobs are `NotFound`.
    pub async fn subscribe(&self, job_id: &str) -> Result<EventStream, RegistryError> {
        let job = self.registry.get(job_id).await?;
        if let Some(terminal) = JobEvent::terminal_from(&job) {
            return Ok(stream::once(async move { terminal }).boxed());
        }

        let rx = self.sender(job_id).subscribe();

        // The job may have finished between the read and the subscribe
        let job = self.registry.get(job_id).await?;
        if let Some(terminal) = JobEvent::terminal_from(&job) {
            drop(rx);
            self.channels().remove(job_id);
            return Ok(stream::once(async move { terminal }).boxed());
        }

        let resync_id = job_id.to_string();
        let live = BroadcastStream::new(rx).scan(
            (false, None::<StageName>),
            move |state: &mut (bool, Option<StageName>), item| {
                let (finished, last_stage) = (&mut state.0, &mut state.1);
                let event = match item {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::debug!(job_id = %resync_id, missed, "subscriber lagged");
                        JobEvent::resync(&resync_id, *last_stage, missed)
                    }
                };
                let next = if *finished {
                    None
                } else {
                    *finished = event.is_terminal();
                    if event.stage_name.is_some() {
                        *last_stage = event.stage_name;
                    }
                    Some(event)
                };
                futures::future::ready(next)
            },
        );

        Ok(live.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::events::EventKind;
    use crate::stages::StageName;
    use crate::state::JobOutcome;

    async fn setup(capacity: usize) -> (Arc<JobRegistry>, EventBroadcaster) {
        let registry = Arc::new(JobRegistry::in_memory());
        registry.create("job", "idea").await.unwrap();
        let broadcaster = EventBroadcaster::new(registry.clone(), capacity);
        broadcaster.open("job");
        (registry, broadcaster)
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (_, broadcaster) = setup(8).await;
        assert!(matches!(
            broadcaster.subscribe("nope").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_live_stream_ends_after_terminal() {
        let (registry, broadcaster) = setup(8).await;
        let stream = broadcaster.subscribe("job").await.unwrap();

        broadcaster.publish(JobEvent::job_started("job")).await.unwrap();
        broadcaster
            .publish(JobEvent::stage_started("job", StageName::NormalizeIdea))
            .await
            .unwrap();
        registry.finalize("job", JobOutcome::Completed).await.unwrap();
        broadcaster.publish(JobEvent::job_completed("job")).await.unwrap();

        let events: Vec<JobEvent> = stream.collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].sequence, 3);
        assert!(events[2].is_terminal());
        assert_eq!(broadcaster.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_terminal_job_yields_one_event() {
        let (registry, broadcaster) = setup(8).await;
        registry.finalize("job", JobOutcome::Completed).await.unwrap();
        broadcaster.publish(JobEvent::job_completed("job")).await.unwrap();

        for _ in 0..3 {
            let events: Vec<JobEvent> = broadcaster.subscribe("job").await.unwrap().collect().await;
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind, EventKind::Completed);
        }
        assert_eq!(broadcaster.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_finalized_but_unpublished_job_yields_one_event() {
        let (registry, broadcaster) = setup(8).await;
        registry.finalize("job", JobOutcome::Completed).await.unwrap();

        let events: Vec<JobEvent> = broadcaster.subscribe("job").await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[tokio::test]
    async fn test_duplicate_terminal_is_dropped() {
        let (registry, broadcaster) = setup(8).await;
        registry.finalize("job", JobOutcome::Completed).await.unwrap();
        broadcaster.publish(JobEvent::job_completed("job")).await.unwrap();
        assert!(matches!(
            broadcaster.publish(JobEvent::job_completed("job")).await,
            Err(RegistryError::DuplicateTerminal(_))
        ));
        assert_eq!(registry.events("job").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_resync_hint() {
        let (registry, broadcaster) = setup(2).await;
        let stream = broadcaster.subscribe("job").await.unwrap();

        for _ in 0..5 {
            broadcaster
                .publish(JobEvent::stage_progressed("job", StageName::MarketResearch, "retrying"))
                .await
                .unwrap();
        }
        registry.finalize("job", JobOutcome::Completed).await.unwrap();
        broadcaster.publish(JobEvent::job_completed("job")).await.unwrap();

        let events: Vec<JobEvent> = stream.collect().await;
        assert!(events[0].message.starts_with("Missed"));
        assert_eq!(events[0].kind, EventKind::Progressed);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_resync_hint_keeps_stage_order() {
        let (registry, broadcaster) = setup(2).await;
        let mut stream = broadcaster.subscribe("job").await.unwrap();

        broadcaster
            .publish(JobEvent::stage_started("job", StageName::Feasibility))
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.stage_name, Some(StageName::Feasibility));

        for _ in 0..5 {
            broadcaster
                .publish(JobEvent::stage_progressed("job", StageName::Strategy, "retrying"))
                .await
                .unwrap();
        }
        registry.finalize("job", JobOutcome::Completed).await.unwrap();
        broadcaster.publish(JobEvent::job_completed("job")).await.unwrap();

        let rest: Vec<JobEvent> = stream.collect().await;
        assert!(rest[0].message.starts_with("Missed"));
        assert_eq!(rest[0].stage_name, Some(StageName::Feasibility));

        let ordinals: Vec<u16> = std::iter::once(&first)
            .chain(rest.iter())
            .map(|e| e.ordinal())
            .collect();
        assert!(ordinals.windows(2).all(|w| w[0] <= w[1]), "{:?}", ordinals);
        assert!(rest.last().unwrap().is_terminal());
    }
}
