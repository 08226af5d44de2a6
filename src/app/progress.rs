//! Progress bar fed by the engine's event stream.

use std::time::Duration;

use acquirer_core::gateway::EventKind;
use acquirer_core::{ProgressEvent, ProgressSubscriber, TargetId, TargetPhase};
use dashmap::DashMap;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

/// Tracks settled targets and renders `[settled/total] last event`.
pub(crate) struct ProgressDisplay {
    bar: ProgressBar,
    phases: DashMap<TargetId, TargetPhase>,
}

impl ProgressDisplay {
    /// A hidden display still counts, so the caller need not branch.
    pub(crate) fn new(total: usize, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new(u64::try_from(total).unwrap_or(u64::MAX));
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{pos}/{len}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            bar,
            phases: DashMap::new(),
        }
    }

    pub(crate) fn settled(&self) -> usize {
        self.phases.iter().filter(|e| e.value().is_settled()).count()
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSubscriber for ProgressDisplay {
    fn on_event(&self, event: &ProgressEvent) {
        match &event.kind {
            EventKind::Transition => {
                self.phases
                    .insert(event.target_id.clone(), event.phase.clone());
                self.bar
                    .set_position(u64::try_from(self.settled()).unwrap_or(u64::MAX));
                self.bar
                    .set_message(format!("{} {}", event.target_id, event.phase));
            }
            EventKind::Progress { bytes } => {
                let strategy = event.strategy.as_deref().unwrap_or("?");
                self.bar.set_message(format!(
                    "{} {strategy}: {} KiB",
                    event.target_id,
                    bytes / 1024
                ));
            }
            EventKind::AttemptOutcome { .. } => {
                self.bar.set_message(format!("{} {}", event.target_id, event.summary));
            }
        }
    }

    fn on_lagged(&self, missed: u64) {
        warn!(missed, "progress display fell behind");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_display_counts_settled_targets_once() {
        let display = ProgressDisplay::new(2, false);
        let a = TargetId::new("a");
        let b = TargetId::new("b");

        display.on_event(&ProgressEvent::transition(a.clone(), TargetPhase::Pending, ""));
        assert_eq!(display.settled(), 0);

        display.on_event(&ProgressEvent::transition(a.clone(), TargetPhase::Exhausted, ""));
        display.on_event(&ProgressEvent::transition(b, TargetPhase::Done, ""));
        assert_eq!(display.settled(), 2);

        display.on_event(&ProgressEvent::transition(a.clone(), TargetPhase::ManualPending, ""));
        assert_eq!(display.settled(), 1);

        display.on_event(&ProgressEvent::transition(a, TargetPhase::Done, ""));
        assert_eq!(display.settled(), 2);
    }

    #[test]
    fn test_progress_display_accepts_progress_events() {
        let display = ProgressDisplay::new(1, false);
        display.on_event(&ProgressEvent::progress(TargetId::new("a"), "direct", 4096));
        assert_eq!(display.settled(), 0);
    }
}
