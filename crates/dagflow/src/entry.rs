//! Graph entries: the unit of work the runner schedules.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Operation to execute at every node of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Plan,
    Apply,
    Destroy,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a scheduled entry.
///
/// `NoOp` is terminal and assigned once at creation time; it is never
/// re-entered after a node has started executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Executing,
    Success,
    Failed,
    NoOp,
}

impl EntryState {
    /// True if a successor's readiness gate treats this state as satisfied.
    pub fn satisfies_gate(self) -> bool {
        matches!(self, Self::Success | Self::NoOp)
    }
}

/// Outcome of executing one entry.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub output: Vec<String>,
    pub changes_detected: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A unit of executable work attached to a graph node.
///
/// Implementations block until the underlying command finishes; the runner
/// calls `execute` from worker threads.
pub trait Entry: Send + Sync {
    /// Absolute directory this entry runs in.
    fn path(&self) -> &Path;

    /// Run the operation and report its outcome. An `Err` here means the
    /// command could not be launched at all; it is recorded as a failure
    /// for this node, not a fatal error for the run.
    fn execute(&self, operation: Operation, debug: bool) -> Result<ExecutionResult>;
}

/// Live-or-skipped decision, made once when a node is first scheduled.
pub enum GraphEntry {
    /// Executes the real command.
    Live(Box<dyn Entry>),
    /// Outside the run's scope; always reports success without executing.
    NoOp(PathBuf),
}

impl GraphEntry {
    pub fn path(&self) -> &Path {
        match self {
            Self::Live(entry) => entry.path(),
            Self::NoOp(path) => path,
        }
    }

    pub fn initial_state(&self) -> EntryState {
        match self {
            Self::Live(_) => EntryState::Pending,
            Self::NoOp(_) => EntryState::NoOp,
        }
    }

    pub fn execute(&self, operation: Operation, debug: bool) -> Result<ExecutionResult> {
        match self {
            Self::Live(entry) => entry.execute(operation, debug),
            Self::NoOp(path) => {
                log::info!("skipping {} {}", path.display(), operation);
                Ok(ExecutionResult {
                    exit_code: 0,
                    output: Vec::new(),
                    changes_detected: false,
                })
            }
        }
    }
}

/// Creates entries on demand as the scheduler reaches nodes.
///
/// The factory owns the scope test: paths outside the run's scope come back
/// as [`GraphEntry::NoOp`]. A factory error is a configuration error and
/// aborts the whole run before any further node is scheduled.
pub trait EntryFactory: Send + Sync {
    fn create(&self, path: &Path) -> Result<GraphEntry>;
}
