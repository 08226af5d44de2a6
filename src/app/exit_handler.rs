//! Exit code logic for the acquirer process.
//!
//! Single responsibility: map a batch report to the process exit outcome.

use acquirer_core::BatchReport;

use crate::ProcessExit;

pub(crate) fn determine_exit_outcome(report: &BatchReport) -> ProcessExit {
    if report.all_done() {
        ProcessExit::Success
    } else {
        ProcessExit::Incomplete
    }
}
