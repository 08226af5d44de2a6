//! Outbound progress events.
//!
//! Events go through a bounded broadcast channel. Publishing never waits: a
//! subscriber that falls behind loses the oldest events and is told how many
//! it missed.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::failure::FailureCategory;
use crate::machine::TargetPhase;
use crate::target::TargetId;

/// Events buffered per subscriber before the oldest are dropped.
pub const EVENT_BUFFER: usize = 1024;

/// What an event reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The target entered `phase`.
    Transition,
    /// An attempt concluded; `category` is set for failures.
    AttemptOutcome { category: Option<FailureCategory> },
    /// A long transfer reported forward progress.
    Progress { bytes: u64 },
}

/// One outbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub target_id: TargetId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub phase: TargetPhase,
    pub strategy: Option<String>,
    pub summary: String,
}

impl ProgressEvent {
    #[must_use]
    pub fn transition(target_id: TargetId, phase: TargetPhase, summary: impl Into<String>) -> Self {
        Self {
            target_id,
            kind: EventKind::Transition,
            strategy: phase.strategy().map(str::to_string),
            phase,
            summary: summary.into(),
        }
    }

    #[must_use]
    pub fn attempt_outcome(
        target_id: TargetId,
        phase: TargetPhase,
        strategy: impl Into<String>,
        category: Option<FailureCategory>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            target_id,
            kind: EventKind::AttemptOutcome { category },
            phase,
            strategy: Some(strategy.into()),
            summary: summary.into(),
        }
    }

    #[must_use]
    pub fn progress(target_id: TargetId, strategy: impl Into<String>, bytes: u64) -> Self {
        let strategy = strategy.into();
        Self {
            target_id,
            kind: EventKind::Progress { bytes },
            phase: TargetPhase::Attempting {
                strategy: strategy.clone(),
            },
            summary: format!("{bytes} bytes received"),
            strategy: Some(strategy),
        }
    }
}

/// Receives events on its own task.
///
/// Implementations should return quickly; a slow subscriber only delays its
/// own queue.
pub trait ProgressSubscriber: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);

    /// Called when events were dropped because this subscriber lagged.
    fn on_lagged(&self, missed: u64) {
        warn!(missed, "progress subscriber lagged; events dropped");
    }
}

/// Fan-out of progress events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes without waiting. Events with no subscriber are discarded.
    pub fn publish(&self, event: ProgressEvent) {
        if self.sender.send(event).is_err() {
            debug!("no progress subscribers");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Drives `subscriber` from a dedicated task until the bus is dropped.
    pub fn attach(&self, subscriber: Arc<dyn ProgressSubscriber>) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => subscriber.on_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => subscriber.on_lagged(missed),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<ProgressEvent>>,
        lagged: Mutex<u64>,
    }

    impl ProgressSubscriber for Collect {
        fn on_event(&self, event: &ProgressEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn on_lagged(&self, missed: u64) {
            *self.lagged.lock().unwrap() += missed;
        }
    }

    fn event(n: u64) -> ProgressEvent {
        ProgressEvent::progress(TargetId::new("t"), "direct", n)
    }

    #[test]
    fn test_publish_without_subscribers_does_not_fail() {
        EventBus::default().publish(event(1));
    }

    #[test]
    fn test_transition_event_carries_strategy() {
        let event = ProgressEvent::transition(
            TargetId::new("t"),
            TargetPhase::Attempting {
                strategy: "apple".to_string(),
            },
            "",
        );
        assert_eq!(event.strategy.as_deref(), Some("apple"));
        assert_eq!(event.kind, EventKind::Transition);
    }

    #[test]
    fn test_event_serializes_flat() {
        let json = serde_json::to_value(event(42)).unwrap();
        assert_eq!(json["kind"], "progress");
        assert_eq!(json["bytes"], 42);
        assert_eq!(json["target_id"], "t");
    }

    #[tokio::test]
    async fn test_attached_subscriber_sees_events_in_order() {
        let bus = EventBus::new(16);
        let collect = Arc::new(Collect::default());
        let handle = bus.attach(collect.clone());

        for n in 0..3 {
            bus.publish(event(n));
        }
        drop(bus);
        handle.await.unwrap();

        let events = collect.events.lock().unwrap();
        let bytes: Vec<_> = events
            .iter()
            .map(|e| match e.kind {
                EventKind::Progress { bytes } => bytes,
                _ => u64::MAX,
            })
            .collect();
        assert_eq!(bytes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut receiver = bus.subscribe();
        for n in 0..10 {
            bus.publish(event(n));
        }
        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Lagged(8))
        ));
    }
}
