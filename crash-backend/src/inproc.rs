//! The in-process backend.
//!
//! On a fault, the crash event is built and persisted by the faulting process
//! itself, from within the signal handler (or exception filter), before the
//! fault is passed on to whichever handler was installed before ours.

use crate::{
    Backend, ChainAction, ExceptionHook, FaultContext, FaultHandler, FaultScope, Host,
    SessionStatus, chain, event,
};
use std::sync::Arc;

#[derive(Clone)]
struct InProcHandler {
    host: Arc<dyn Host>,
}

impl InProcHandler {
    /// Captures and persists the crash event for a fault
    fn capture(&self, context: &FaultContext, fault: &FaultScope) {
        crate::debug_print!("capturing crash event");

        let host = &*self.host;
        host.write_crash_marker(fault);

        // Anything captured from here on, including the crash event itself,
        // goes straight to disk
        let prior = host.enforce_disk_transport(fault);
        host.end_current_session_with_status(SessionStatus::Crashed);

        let descriptor = crate::descriptor_for(context.code());

        let mut frames = [0usize; event::MAX_FRAMES];
        let count = host.unwind(context, &mut frames).min(frames.len());

        let event = event::make_signal_event(descriptor, &frames[..count]);
        host.capture_event(event);

        if let Some(prior) = prior {
            crate::debug_print!("dumping queued envelopes");
            prior.dump_queue(&host.options().run_path);
        }

        crate::debug_print!("crash event captured");
    }
}

unsafe impl FaultHandler for InProcHandler {
    fn on_fault(&self, context: &FaultContext, fault: &FaultScope) -> ChainAction {
        self.capture(context, fault);

        if cfg!(windows) {
            ChainAction::ContinueSearch
        } else {
            ChainAction::InvokePrevious
        }
    }
}

/// Captures crashes from within the crashing process
#[derive(Default)]
pub struct InProcBackend {
    handler: Option<InProcHandler>,
    attached: bool,
}

impl InProcBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the handler chain was successfully attached at startup
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Runs the capture pipeline for a fault with the specified code as if it
    /// had actually been raised, without passing it on to any other handler.
    ///
    /// Note that the allocator stays in emergency mode after this returns.
    pub fn simulate_fault(&self, code: i32) {
        let Some(handler) = &self.handler else {
            return;
        };

        crate::with_synthetic_context(code, |context| {
            let fault = FaultScope::enter();
            handler.capture(context, &fault);
        });
    }
}

impl Backend for InProcBackend {
    fn startup(&mut self, host: Arc<dyn Host>) {
        let handler = InProcHandler { host };

        crate::alloc::reserve();

        match chain::attach(Box::new(handler.clone())) {
            Ok(()) => {
                self.attached = true;

                #[cfg(windows)]
                crate::windows::suppress_crash_dialogs();
            }
            Err(err) => {
                log::debug!("failed to install in-process crash handler: {err}");
            }
        }

        self.handler = Some(handler);
    }

    fn shutdown(&mut self) {
        if std::mem::take(&mut self.attached) {
            chain::detach();
        }

        self.handler = None;
    }

    fn exception_hook(&self) -> Option<&dyn ExceptionHook> {
        Some(self)
    }
}

impl ExceptionHook for InProcBackend {
    /// Captures the crash, and on unix then restores the previous
    /// dispositions and invokes the previous handler for the signal, which
    /// usually terminates the process
    fn handle_exception(&self, context: &FaultContext) {
        let Some(handler) = &self.handler else {
            return;
        };

        let fault = FaultScope::enter();
        handler.capture(context, &fault);
        fault.leave();

        #[cfg(unix)]
        chain::invoke_previous_handler(context);
    }
}
