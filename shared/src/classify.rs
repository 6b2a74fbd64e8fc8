//! Result classification
//!
//! Maps the raw outcome of one phone's command sequence to the status and
//! message that get persisted.

use crate::{defaults, Outcome, Status};

/// Status and message derived from an [`Outcome`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: Status,
    pub message: String,
}

/// Classify an outcome. Pure and deterministic.
pub fn classify(outcome: &Outcome) -> Classification {
    match outcome {
        Outcome::Failed { error } => Classification {
            status: Status::Error,
            message: error.clone(),
        },
        Outcome::Response { code } => Classification {
            status: if *code <= defaults::SUCCESS_THRESHOLD {
                Status::Success
            } else {
                Status::Error
            },
            message: format!("Response {}", code),
        },
    }
}

/// Collapse the per-step response codes of one sequence into a single code.
///
/// When every step is at or below the success threshold the result is
/// [`defaults::OK_CODE`]. Otherwise it is the code of the last step, even if
/// the failing step came earlier.
pub fn aggregate_codes(codes: &[u16]) -> u16 {
    if codes.iter().all(|c| *c <= defaults::SUCCESS_THRESHOLD) {
        return defaults::OK_CODE;
    }
    codes.last().copied().unwrap_or(defaults::OK_CODE)
}
