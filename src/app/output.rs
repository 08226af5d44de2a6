//! Plain-text rendering of states, attempts and reports.

use acquirer_core::gateway::ExhaustedTarget;
use acquirer_core::{AttemptRecord, BatchReport, TargetState, TransitionRecord};

pub(crate) fn format_attempt(attempt: &AttemptRecord) -> String {
    let outcome = match (&attempt.category, attempt.is_success()) {
        (_, true) => "success".to_string(),
        (Some(category), false) => category.to_string(),
        (None, false) => "failure".to_string(),
    };
    let mut line = format!(
        "  #{} pass {} {:<16} {:<13} {}",
        attempt.id,
        attempt.pass,
        attempt.strategy,
        outcome,
        httpdate::fmt_http_date(attempt.started_at),
    );
    if attempt.manual {
        line.push_str(" [manual]");
    }
    if let Some(message) = &attempt.message {
        line.push_str(" - ");
        line.push_str(message);
    }
    line
}

pub(crate) fn format_transition(transition: &TransitionRecord) -> String {
    let mut line = format!(
        "  pass {} {:<24} {}",
        transition.pass,
        transition.phase.to_string(),
        httpdate::fmt_http_date(transition.recorded_at),
    );
    if let Some(detail) = &transition.detail {
        line.push_str(" - ");
        line.push_str(detail);
    }
    line
}

pub(crate) fn format_state(state: &TargetState) -> String {
    let mut line = format!("{} [{}] {}", state.target_id, state.phase, state.label);
    if let Some(path) = &state.artifact_path {
        line.push_str(&format!(" -> {}", path.display()));
    }
    if let Some(reason) = &state.reason {
        line.push_str(&format!(" ({reason})"));
    }
    line
}

pub(crate) fn print_exhausted(exhausted: &[ExhaustedTarget]) {
    if exhausted.is_empty() {
        println!("No exhausted targets.");
        return;
    }
    for target in exhausted {
        println!("{}", format_state(&target.state));
        for attempt in &target.attempts {
            println!("{}", format_attempt(attempt));
        }
    }
}

pub(crate) fn print_summary(report: &BatchReport) {
    use acquirer_core::TargetPhase;

    println!(
        "Done: {}  Exhausted: {}  Failed: {}  Attempts: {}  Retries: {}",
        report.count(&TargetPhase::Done),
        report.count(&TargetPhase::Exhausted),
        report.count(&TargetPhase::Failed),
        report.attempts,
        report.retried,
    );
    for state in report
        .targets
        .iter()
        .filter(|s| s.phase == TargetPhase::Failed)
    {
        println!("{}", format_state(state));
    }
    if !report.strategy_stats.is_empty() {
        println!("Strategies:");
        for stats in &report.strategy_stats {
            println!(
                "  {:<16} {} ok / {} failed",
                stats.strategy, stats.successes, stats.failures
            );
        }
    }
}
