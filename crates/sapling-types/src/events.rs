//! Execution status and the ordered stream of execution events.
//!
//! For every execution the event order is strict: `execution_start`, then
//! per tick `tick_start`, zero or more `entry_committed` (always before that
//! tick's `tick_end`), `tick_end`, and finally `execution_end` followed by
//! `result`.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::content::TimelineEntry;
use crate::ids::{ExecutionId, SessionId};
use crate::tick::{QueuedMessage, StopReason, Usage};

/// Status of an execution handle.
///
/// Transitions are monotonic: once terminal, a status never returns to
/// [`ExecutionStatus::Running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ExecutionStatus {
    /// Ticks are in flight.
    Running,
    /// Finished normally.
    Completed,
    /// Cancelled cooperatively.
    Aborted,
    /// Finished with an error.
    Failed,
}

impl ExecutionStatus {
    /// Whether this status is final.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(self, Self::Running) && next.is_terminal()
    }
}

impl core::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One event emitted by an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum StreamEvent {
    /// The execution began.
    ExecutionStart {
        /// Execution identifier.
        execution_id: ExecutionId,
        /// Owning session.
        session_id: SessionId,
    },
    /// A tick began.
    TickStart {
        /// Tick number.
        tick: u64,
    },
    /// The tree settled for this tick.
    Compiled {
        /// Tick number.
        tick: u64,
        /// Number of compile passes.
        iterations: u32,
        /// Whether the iteration cap was hit.
        forced_stable: bool,
    },
    /// A message was queued while the execution was running.
    MessageQueued {
        /// The queued message.
        message: QueuedMessage,
    },
    /// An entry was committed to the timeline.
    EntryCommitted {
        /// Tick number.
        tick: u64,
        /// The committed entry.
        entry: TimelineEntry,
    },
    /// A tick finished.
    TickEnd {
        /// Tick number.
        tick: u64,
        /// Model stop reason, if the model was called.
        stop_reason: Option<StopReason>,
        /// Usage reported during the tick.
        usage: Usage,
    },
    /// The execution finished.
    ExecutionEnd {
        /// Execution identifier.
        execution_id: ExecutionId,
        /// Final status.
        status: ExecutionStatus,
        /// Number of ticks run.
        ticks: u64,
    },
    /// Final result of the execution.
    Result {
        /// Execution identifier.
        execution_id: ExecutionId,
        /// Text of the last assistant entry, when completed.
        output: Option<String>,
        /// Usage accumulated during the execution.
        usage: Usage,
        /// Error message, when aborted or failed.
        error: Option<String>,
    },
}

impl StreamEvent {
    /// Short event name, matching the serialized `type` tag.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStart { .. } => "execution_start",
            Self::TickStart { .. } => "tick_start",
            Self::Compiled { .. } => "compiled",
            Self::MessageQueued { .. } => "message_queued",
            Self::EntryCommitted { .. } => "entry_committed",
            Self::TickEnd { .. } => "tick_end",
            Self::ExecutionEnd { .. } => "execution_end",
            Self::Result { .. } => "result",
        }
    }
}
