//! Event types broadcast between components.
//!
//! Every producer owns a `tokio::sync::broadcast::Sender`; consumers call
//! `subscribe()`. Events are sent synchronously at the point the state
//! change happens, so a subscriber that existed before a call returns sees
//! the event by the time the call returns.

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of every event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

pub fn event_channel<T: Clone>() -> broadcast::Sender<T> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Kernel status as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// Nothing known yet (not started)
    Unknown,
    /// Kernel is starting up
    Starting,
    /// Kernel is ready and idle
    Idle,
    /// Kernel is executing code
    Busy,
    /// Kernel is being replaced by a restart
    Restarting,
    /// Kernel went away without being asked to
    Dead,
    /// Kernel was shut down on request
    Disposed,
}

impl KernelStatus {
    /// Terminal states: a kernel in one of these is never reused.
    pub fn is_terminal(self) -> bool {
        matches!(self, KernelStatus::Dead | KernelStatus::Disposed)
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Unknown => write!(f, "unknown"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::Dead => write!(f, "dead"),
            KernelStatus::Disposed => write!(f, "disposed"),
        }
    }
}

impl From<&jupyter_protocol::ExecutionState> for KernelStatus {
    fn from(state: &jupyter_protocol::ExecutionState) -> Self {
        match state {
            jupyter_protocol::ExecutionState::Busy => KernelStatus::Busy,
            jupyter_protocol::ExecutionState::Idle => KernelStatus::Idle,
            jupyter_protocol::ExecutionState::Starting => KernelStatus::Starting,
            jupyter_protocol::ExecutionState::Restarting => KernelStatus::Restarting,
            jupyter_protocol::ExecutionState::Terminating
            | jupyter_protocol::ExecutionState::Dead => KernelStatus::Dead,
            _ => KernelStatus::Unknown,
        }
    }
}

/// Parse the `execution_state` string from the REST API.
pub fn status_from_execution_state(state: &str) -> KernelStatus {
    match state {
        "starting" => KernelStatus::Starting,
        "idle" => KernelStatus::Idle,
        "busy" => KernelStatus::Busy,
        "restarting" | "autorestarting" => KernelStatus::Restarting,
        "dead" | "terminating" => KernelStatus::Dead,
        _ => KernelStatus::Unknown,
    }
}

/// Lifecycle events of a restart session.
///
/// A restart session is the replacement kernel spun up during a restart. It
/// should stay hidden from kernel pickers between `Created` and `Used`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartSessionEvent {
    Created { kernel_id: String },
    Used { kernel_id: String },
}

/// Events published by a lifecycle-managed kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    Started,
    Restarted,
    StatusChanged(KernelStatus),
    /// The kernel exited unexpectedly.
    Died { reason: String },
    /// The kernel was disposed on request.
    Disposed,
}
