//! Event definitions for the monitoring event loop.
//!
//! The lifecycle monitor publishes typed events on a channel; external
//! collaborators (the CLI frontend, play-time persistence, presence
//! integrations) subscribe instead of coupling to the monitor. `Stopped`
//! fires exactly once per run, after all restore side effects have run.

use std::time::Duration;

use crate::output::StreamKind;

/// Final accounting for a run, carried by the terminal `Stopped` event.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Wall-clock time between start and finalization.
    pub duration: Duration,
    /// Exit code of the innermost command, recovered from the wrapper's
    /// side file; `None` when the file was missing or unparseable.
    pub return_code: Option<i32>,
    /// Session too short to count toward play time.
    pub short_session: bool,
    /// Actionable message translated from known exit-code/output pairs.
    pub diagnostic: Option<String>,
}

/// Represents an event in the run's lifecycle.
#[derive(Debug, Clone)]
pub enum Event {
    /// The owned process was spawned.
    Started { pid: u32 },
    /// A line of output was received from the game's process tree.
    Output { line: String, stream: StreamKind },
    /// The owned process exited (OS notification; the tree may live on).
    Exited,
    /// The launch failed outright; the run is over.
    Failed { error: String },
    /// The forced-stop sequence ran its course (killed survivors or timed
    /// out); the run must now finalize.
    ForceStopDone,
    /// Terminal state: fired exactly once per run.
    Stopped(RunReport),
}
