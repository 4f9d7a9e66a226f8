//! Progress streaming.
//!
//! A subscription follows the tracker's watch channel while the deployment
//! is live and re-emits the latest snapshot on every interval tick. Once the
//! deployment is no longer tracked it falls back to polling the store. The
//! stream ends after the first terminal snapshot.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{unfold, Stream};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::error::ControlResult;
use crate::store::ClusterStore;
use crate::tracker::{DeploymentSnapshot, DeploymentTracker};
use crate::types::DeploymentId;

/// One item of a progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Current state of a running deployment.
    Snapshot(DeploymentSnapshot),
    /// Final state. Nothing follows.
    Complete(DeploymentSnapshot),
    /// The stream could not be served. Nothing follows.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl StreamEvent {
    /// SSE event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "progress",
            Self::Complete(_) => "complete",
            Self::Error { .. } => "error",
        }
    }

    fn from_snapshot(snapshot: DeploymentSnapshot) -> Self {
        if snapshot.is_terminal() {
            Self::Complete(snapshot)
        } else {
            Self::Snapshot(snapshot)
        }
    }

    const fn is_last(&self) -> bool {
        !matches!(self, Self::Snapshot(_))
    }
}

/// A boxed progress stream.
pub type ProgressStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Serves progress streams.
#[derive(Clone)]
pub struct ProgressStreamer {
    tracker: Arc<DeploymentTracker>,
    store: Arc<dyn ClusterStore>,
    interval: Duration,
}

enum Source {
    Start,
    Live(watch::Receiver<DeploymentSnapshot>),
    Polling,
    Done,
}

struct Subscription {
    id: DeploymentId,
    tracker: Arc<DeploymentTracker>,
    store: Arc<dyn ClusterStore>,
    ticker: Interval,
    source: Source,
}

impl ProgressStreamer {
    /// Create a streamer emitting at least once per `interval`.
    pub fn new(
        tracker: Arc<DeploymentTracker>,
        store: Arc<dyn ClusterStore>,
        interval: Duration,
    ) -> Self {
        Self {
            tracker,
            store,
            interval,
        }
    }

    /// Subscribe to a deployment's progress.
    ///
    /// An unknown deployment yields a single [`StreamEvent::Error`].
    #[must_use]
    pub fn subscribe(&self, id: DeploymentId) -> ProgressStream {
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let subscription = Subscription {
            id,
            tracker: self.tracker.clone(),
            store: self.store.clone(),
            ticker,
            source: Source::Start,
        };

        Box::pin(unfold(subscription, |mut sub| async move {
            let event = sub.next_event().await?;
            if event.is_last() {
                sub.source = Source::Done;
            }
            Some((event, sub))
        }))
    }
}

impl Subscription {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        match &mut self.source {
            Source::Done => None,
            Source::Start => Some(self.start().await),
            Source::Live(receiver) => {
                let live = tokio::select! {
                    changed = receiver.changed() => changed.is_ok(),
                    _ = self.ticker.tick() => true,
                };
                if live {
                    let snapshot = receiver.borrow_and_update().clone();
                    Some(StreamEvent::from_snapshot(snapshot))
                } else {
                    // Pruned from the tracker: the store has the rest.
                    debug!(deployment_id = %self.id, "tracker entry gone, polling store");
                    self.source = Source::Polling;
                    Some(self.poll().await)
                }
            }
            Source::Polling => {
                self.ticker.tick().await;
                Some(self.poll().await)
            }
        }
    }

    async fn start(&mut self) -> StreamEvent {
        if let Some(mut receiver) = self.tracker.subscribe(&self.id) {
            let snapshot = receiver.borrow_and_update().clone();
            self.source = Source::Live(receiver);
            return StreamEvent::from_snapshot(snapshot);
        }
        self.source = Source::Polling;
        self.poll().await
    }

    async fn poll(&self) -> StreamEvent {
        match load(&*self.store, &self.id).await {
            Ok(Some(snapshot)) => StreamEvent::from_snapshot(snapshot),
            Ok(None) => StreamEvent::Error {
                message: format!("deployment not found: {}", self.id),
            },
            Err(e) => StreamEvent::Error {
                message: e.to_string(),
            },
        }
    }
}

async fn load(
    store: &dyn ClusterStore,
    id: &DeploymentId,
) -> ControlResult<Option<DeploymentSnapshot>> {
    let Some(record) = store.get_deployment(id).await? else {
        return Ok(None);
    };
    let tasks = store.list_tasks(id).await?;
    Ok(Some(DeploymentSnapshot::new(&record, &tasks)))
}

impl std::fmt::Debug for ProgressStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStreamer")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{
        ClusterId, DeploymentAction, DeploymentData, DeploymentOptions, DeploymentRecord,
        DeploymentStatus,
    };
    use futures::StreamExt;

    fn streamer(tracker: &Arc<DeploymentTracker>, store: &Arc<MemoryStore>) -> ProgressStreamer {
        ProgressStreamer::new(tracker.clone(), store.clone(), Duration::from_millis(20))
    }

    fn record() -> DeploymentRecord {
        DeploymentRecord::new(DeploymentData::new(
            ClusterId::generate(),
            DeploymentAction::Deploy,
            DeploymentOptions::default(),
        ))
    }

    #[tokio::test]
    async fn unknown_deployment_yields_one_error() {
        let tracker = Arc::new(DeploymentTracker::new(Duration::from_secs(60)));
        let store = Arc::new(MemoryStore::new());
        let mut stream = streamer(&tracker, &store).subscribe(DeploymentId::generate());

        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Error { .. }));
        assert_eq!(first.name(), "error");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn live_stream_ends_on_terminal_snapshot() {
        let tracker = Arc::new(DeploymentTracker::new(Duration::from_secs(60)));
        let store = Arc::new(MemoryStore::new());
        let mut snapshot = DeploymentSnapshot::new(&record(), &[]);
        let id = snapshot.deployment_id.clone();
        tracker.register(snapshot.clone());

        let mut stream = streamer(&tracker, &store).subscribe(id);
        assert!(matches!(stream.next().await.unwrap(), StreamEvent::Snapshot(_)));

        // Interval ticks re-emit the current state.
        match stream.next().await.unwrap() {
            StreamEvent::Snapshot(s) => assert_eq!(s.status, DeploymentStatus::Pending),
            other => panic!("unexpected {other:?}"),
        }

        snapshot.status = DeploymentStatus::Completed;
        snapshot.progress = 100;
        tracker.publish(snapshot);

        let mut last = None;
        while let Some(event) = stream.next().await {
            last = Some(event);
        }
        match last.unwrap() {
            StreamEvent::Complete(s) => assert_eq!(s.progress, 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn untracked_deployment_read_from_store() {
        let tracker = Arc::new(DeploymentTracker::new(Duration::from_secs(60)));
        let store = Arc::new(MemoryStore::new());
        let mut finished = record();
        finished.status = DeploymentStatus::Failed;
        store.create_deployment(&finished, &[]).await.unwrap();

        let events: Vec<_> = streamer(&tracker, &store)
            .subscribe(finished.data.id.clone())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "complete");
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let tracker = Arc::new(DeploymentTracker::new(Duration::from_secs(60)));
        let store = Arc::new(MemoryStore::new());
        let mut snapshot = DeploymentSnapshot::new(&record(), &[]);
        let id = snapshot.deployment_id.clone();
        tracker.register(snapshot.clone());

        let streamer = streamer(&tracker, &store);
        let first = streamer.subscribe(id.clone());
        let second = streamer.subscribe(id);
        drop(first);

        snapshot.status = DeploymentStatus::Cancelled;
        tracker.publish(snapshot);

        let events: Vec<_> = second.collect().await;
        assert_eq!(events.last().unwrap().name(), "complete");
    }
}
