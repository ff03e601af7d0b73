//! Crash capture backends for an error reporting client.
//!
//! A [`Backend`] is the strategy a client uses to capture fatal faults, and
//! exactly one is active per client. This crate provides two of them, plus a
//! [`DisabledBackend`] that does nothing.
//!
//! # In-process
//!
//! [`InProcBackend`] installs handlers for fatal signals (or, on Windows, an
//! unhandled exception filter) directly in the current process. When a fault
//! occurs it builds a minimal crash event containing a backtrace, persists it
//! to disk through the host, and then hands the fault on to whatever handler
//! was installed before it.
//!
//! The following signals are handled on unix targets:
//!
//! * `SIGILL` - an illegal, malformed, unknown, or privileged, instruction
//! * `SIGTRAP` - a trap, eg. a breakpoint or debug assertion
//! * `SIGABRT` - `std::process::abort` or `libc::abort`
//! * `SIGBUS` - a [bus error](https://en.wikipedia.org/wiki/Bus_error)
//! * `SIGFPE` - an erroneous arithmetic operation
//! * `SIGSEGV` - an invalid memory reference, including stack overflows
//!
//! Note that the alternate signal stack needed to handle stack overflows is
//! only installed for the thread that starts the backend; other threads
//! need to have their own (eg. all [`std::thread`]s do).
//!
//! # External process
//!
//! [`ExternalBackend`] launches a separate handler process that watches this
//! one and does the actual crash capture. In-process, the backend only keeps
//! the current scope and breadcrumbs continuously flushed to files that are
//! registered with the handler as attachments, and does a quick flush of any
//! queued data when a fault occurs.
//!
//! # Fault handling
//!
//! Code running while a fault is being handled cannot safely allocate from
//! the normal heap, or block on locks. See [`FaultScope`], [`sync::Mutex`]
//! and [`EmergencyAllocator`] for how this crate deals with that.

#![allow(unsafe_code)]

pub mod alloc;
mod error;
pub mod event;
pub mod external;
mod fault;
mod host;
pub mod inproc;
mod options;
pub mod sync;

pub use alloc::EmergencyAllocator;
pub use error::Error;
pub use external::ExternalBackend;
pub use fault::FaultScope;
pub use host::{Host, ScopeMode, SessionStatus, Transport};
pub use inproc::InProcBackend;
pub use options::{DEFAULT_MAX_BREADCRUMBS, Dsn, Options};
pub use serde_json::Value;

use std::sync::Arc;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        #[cfg(target_os = "windows")]
        libc::write(2, s.as_ptr().cast(), s.len() as u32);

        #[cfg(not(target_os = "windows"))]
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

/// A fault kind this crate knows about
#[derive(Debug, PartialEq, Eq)]
pub struct SignalDescriptor {
    /// The signal number, or the exception code on Windows
    pub code: i32,
    /// The symbolic name of the code, eg. `SIGSEGV`
    pub name: &'static str,
    pub description: &'static str,
}

/// Finds the descriptor for the specified signal number or exception code
#[inline]
pub fn descriptor_for(code: i32) -> Option<&'static SignalDescriptor> {
    DESCRIPTORS.iter().find(|desc| desc.code == code)
}

/// What the handler chain does once a [`FaultHandler`] has run
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainAction {
    /// Invoke the handler (or filter) that was installed before ours
    InvokePrevious,
    /// Let the OS continue its normal unhandled exception processing. On unix
    /// targets this is equivalent to [`Self::InvokePrevious`]
    ContinueSearch,
}

/// Code run by the handler chain when a fault occurs.
///
/// # Safety
///
/// [`Self::on_fault`] runs in a compromised context, eg. inside of a signal
/// handler where only [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html)
/// functions can be called. Implementors must only use the allocator and
/// locks through the fault-aware interfaces of this crate.
pub unsafe trait FaultHandler: Send + Sync {
    fn on_fault(&self, context: &FaultContext, fault: &FaultScope) -> ChainAction;
}

/// The fault hook of a backend
pub trait ExceptionHook {
    /// Captures a crash for an explicitly supplied fault context
    fn handle_exception(&self, context: &FaultContext);
}

/// The hooks of a backend that keep per-run state up to date
pub trait StateHooks {
    /// Persists the current scope
    fn flush_scope(&self);
    /// Persists a breadcrumb. This may be called concurrently from any thread.
    fn add_breadcrumb(&self, breadcrumb: Value);
    /// Synchronizes the current upload consent
    fn user_consent_changed(&self);
}

/// A crash capture strategy.
///
/// Every hook is optional, the host checks the `Option` returned by the hook
/// accessors before calling any of them.
pub trait Backend: Send + Sync {
    /// Called exactly once when the client starts. Failures are never
    /// returned, the backend is left partially or fully inactive instead.
    fn startup(&mut self, _host: Arc<dyn Host>) {}
    /// Called once when the client shuts down, undoing what `startup` did
    fn shutdown(&mut self) {}
    fn exception_hook(&self) -> Option<&dyn ExceptionHook> {
        None
    }
    fn state_hooks(&self) -> Option<&dyn StateHooks> {
        None
    }
}

/// A backend without any hooks
#[derive(Default)]
pub struct DisabledBackend;

impl Backend for DisabledBackend {}

/// Creates the backend this crate was configured with
pub fn new_backend() -> Box<dyn Backend> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "external")] {
            Box::new(ExternalBackend::new())
        } else if #[cfg(feature = "inproc")] {
            Box::new(InProcBackend::new())
        } else {
            Box::new(DisabledBackend)
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;

        pub use unix::{chain, with_synthetic_context, FaultContext, DESCRIPTORS};
        pub(crate) use unix::{current_thread_id, disable_system_crash_reporter};
    } else if #[cfg(target_os = "windows")] {
        mod windows;

        pub use windows::{chain, with_synthetic_context, FaultContext, DESCRIPTORS};
        pub(crate) use windows::{current_thread_id, disable_system_crash_reporter};
    }
}
