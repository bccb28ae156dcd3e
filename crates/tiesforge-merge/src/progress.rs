//! Progress reporting for merge runs.
//!
//! The orchestrator writes [`ProgressUpdate`]s into a [`ProgressReporter`],
//! which forwards them to a pluggable [`ProgressSink`]:
//!
//! - [`JsonLinesSink`] - one JSON object per line (default, on stdout)
//! - [`ChannelSink`] - `mpsc` channel, for embedding and tests
//! - [`ProgressBarSink`] - terminal progress bar
//! - [`TracingSink`] - `tracing` events
//!
//! Emission is fire-and-forget: sinks swallow their own I/O errors and never
//! affect the run.
//!
//! The JSON line format is:
//!
//! ```json
//! {"progress": 20.0, "status": "Merge plan prepared", "phase": "plan_built", "timestamp": "2026-01-05T12:00:00+00:00"}
//! ```

use std::io::Write;
use std::sync::mpsc;

use serde::Serialize;

use crate::MergePhase;

/// A single progress message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Percentage complete, in `[0, 100]`.
    pub progress: f32,
    /// Short human-readable status.
    pub status: String,
    /// Phase the run was in when the message was emitted.
    pub phase: MergePhase,
}

/// Receives progress messages.
pub trait ProgressSink: Send {
    /// Handle one message. Must not block for long and must not panic.
    fn emit(&mut self, update: &ProgressUpdate);
}

/// Forwards progress to a sink, keeping percentages monotonic within a run.
pub struct ProgressReporter {
    sink: Box<dyn ProgressSink>,
    last: f32,
}

impl ProgressReporter {
    /// Create a reporter writing into `sink`.
    pub fn new(sink: Box<dyn ProgressSink>) -> Self {
        Self { sink, last: 0.0 }
    }

    /// Start a new run; percentages may start again from zero.
    pub fn begin(&mut self) {
        self.last = 0.0;
    }

    /// Last percentage reported in this run.
    pub fn fraction(&self) -> f32 {
        self.last
    }

    /// Report progress.
    ///
    /// `fraction` is clamped to `[0, 100]` and never goes below the previous
    /// report of the current run.
    pub fn report(&mut self, phase: MergePhase, fraction: f32, status: impl Into<String>) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 100.0).max(self.last)
        } else {
            self.last
        };
        self.last = fraction;

        let update = ProgressUpdate {
            progress: fraction,
            status: status.into(),
            phase,
        };
        self.sink.emit(&update);
    }
}

/// Line-delimited JSON progress records.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl JsonLinesSink<std::io::Stdout> {
    /// Write records to standard output.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Write records to `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Get the underlying writer back.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    progress: f32,
    status: &'a str,
    phase: MergePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<crate::ErrorKind>,
    timestamp: String,
}

impl<W: Write + Send> ProgressSink for JsonLinesSink<W> {
    fn emit(&mut self, update: &ProgressUpdate) {
        let record = JsonRecord {
            progress: update.progress,
            status: &update.status,
            phase: update.phase,
            error: update.phase.error_kind(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(self.writer, "{}", line);
            let _ = self.writer.flush();
        }
    }
}

/// Sends every update over an `mpsc` channel.
pub struct ChannelSink {
    sender: mpsc::Sender<ProgressUpdate>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&mut self, update: &ProgressUpdate) {
        // A dropped receiver just means nobody is listening.
        let _ = self.sender.send(update.clone());
    }
}

/// Terminal progress bar for interactive use.
pub struct ProgressBarSink {
    progress: indicatif::ProgressBar,
}

impl ProgressBarSink {
    /// Create a new progress bar sink.
    pub fn new() -> Self {
        let progress = indicatif::ProgressBar::new(100);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
        progress.set_style(style);
        Self { progress }
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn emit(&mut self, update: &ProgressUpdate) {
        self.progress.set_position(update.progress as u64);
        match update.phase {
            MergePhase::Done => self.progress.finish_with_message(update.status.clone()),
            MergePhase::Failed { .. } => self.progress.abandon_with_message(update.status.clone()),
            _ => self.progress.set_message(update.status.clone()),
        }
    }
}

/// Emits progress as `tracing` events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&mut self, update: &ProgressUpdate) {
        tracing::info!(
            progress = update.progress,
            phase = update.phase.as_str(),
            "{}",
            update.status
        );
    }
}
