use crate::{FaultContext, FaultScope, Options, Value};
use std::path::Path;

/// The status a session is ended with
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Ok,
    Exited,
    Crashed,
    Abnormal,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Exited => "exited",
            Self::Crashed => "crashed",
            Self::Abnormal => "abnormal",
        }
    }
}

/// Controls which parts of the scope are applied to an event
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScopeMode {
    pub breadcrumbs: bool,
    pub modules: bool,
}

impl ScopeMode {
    /// Only the scope itself, without breadcrumbs or the module list
    pub const NONE: Self = Self {
        breadcrumbs: false,
        modules: false,
    };
    pub const ALL: Self = Self {
        breadcrumbs: true,
        modules: true,
    };
}

/// A transport that might still have events queued in memory
pub trait Transport: Send {
    /// Writes every queued envelope into the run directory
    fn dump_queue(&self, run_path: &Path);
}

/// The client that owns the backend.
///
/// The methods that take a [`FaultScope`] are called from within fault
/// handling and must follow the same rules as a [`crate::FaultHandler`], ie
/// only use the fault-aware allocator and locks, and never block.
pub trait Host: Send + Sync {
    fn options(&self) -> &Options;

    /// Writes the marker that lets the next run know this one crashed
    fn write_crash_marker(&self, fault: &FaultScope);

    /// Replaces the active transport with one that only writes to disk,
    /// returning the previously active transport, if there was one
    fn enforce_disk_transport(&self, fault: &FaultScope) -> Option<Box<dyn Transport>>;

    fn end_current_session_with_status(&self, status: SessionStatus);

    /// Enqueues an event on the active transport
    fn capture_event(&self, event: Value);

    /// True if the user has not given consent to upload reports
    fn should_skip_upload(&self) -> bool;

    /// Copies the current scope into `event`
    fn apply_scope(&self, event: &mut Value, mode: ScopeMode);

    /// Encodes a value to bytes, an empty buffer means encoding failed
    fn encode(&self, value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap_or_default()
    }

    /// Unwinds the stack of the fault into `frames`, innermost frame first,
    /// returning the number of frames that were written
    fn unwind(&self, context: &FaultContext, frames: &mut [usize]) -> usize {
        crate::event::unwind_current_stack(context, frames)
    }
}
