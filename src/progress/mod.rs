//! Progress reporting for a provisioning run

mod reporter;

pub use reporter::{BarProgress, LogProgress, ProgressReporter};
