//! Progress sinks invoked by the dispatcher after every completion.
//!
//! Reporters must return quickly; they run on the dispatcher's critical path.

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

/// Observer of completed/total counts
pub trait ProgressReporter: Send + Sync {
    /// A chunk of addresses is about to be dispatched
    fn chunk_started(&self, _index: usize, _chunks: usize, _addresses: &[String]) {}

    /// `completed` of `total` phones have finished
    fn report(&self, completed: usize, total: usize);

    /// The run is over
    fn finish(&self) {}
}

/// Terminal progress bar
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(0))
    }

    /// Drive an existing bar (hidden bars are handy off-terminal)
    pub fn with_bar(bar: ProgressBar) -> Self {
        let style = ProgressStyle::with_template(
            "{bar:60.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }

    #[cfg(test)]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    #[cfg(test)]
    pub fn length(&self) -> Option<u64> {
        self.bar.length()
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for BarProgress {
    fn chunk_started(&self, index: usize, chunks: usize, addresses: &[String]) {
        self.bar
            .set_message(format!("chunk {}/{} ({} phones)", index, chunks, addresses.len()));
    }

    fn report(&self, completed: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(completed as u64);
    }

    fn finish(&self) {
        self.bar.finish_with_message("done");
    }
}

/// Progress as log lines, for non-interactive runs
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn chunk_started(&self, index: usize, chunks: usize, addresses: &[String]) {
        info!("Chunk {}/{}, contains: {:?}", index, chunks, addresses);
    }

    fn report(&self, completed: usize, total: usize) {
        info!(
            "Tasks complete: {}/{}, pending: {}",
            completed,
            total,
            total.saturating_sub(completed)
        );
    }
}
