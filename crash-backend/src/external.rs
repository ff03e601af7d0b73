//! The external process backend.
//!
//! The actual crash capture is done by a separate handler process that is
//! launched at startup. The in-process part of this backend keeps the scope
//! and breadcrumbs flushed to the run files that the handler attaches to its
//! reports, keeps the upload consent in the report database up to date, and
//! on a fault does a quick flush of what the host still has queued before
//! passing the fault on.

pub mod database;
pub mod launcher;
pub mod run_state;

pub use database::{ReportDatabase, Settings};
pub use launcher::{HandlerProcess, StartHandlerArgs, resolve_handler_path};
pub use run_state::RunState;

use crate::{
    Backend, ChainAction, Error, ExceptionHook, FaultContext, FaultHandler, FaultScope, Host,
    SessionStatus, StateHooks, Value, chain, sync::Mutex,
};
use std::{path::Path, sync::Arc};

#[derive(Clone)]
struct ExternalHandler {
    host: Arc<dyn Host>,
}

impl ExternalHandler {
    fn flush(&self, fault: &FaultScope) {
        crate::debug_print!("flushing before the external handler takes over");

        let host = &*self.host;
        host.write_crash_marker(fault);
        let prior = host.enforce_disk_transport(fault);
        host.end_current_session_with_status(SessionStatus::Crashed);

        if let Some(prior) = prior {
            prior.dump_queue(&host.options().run_path);
        }
    }
}

unsafe impl FaultHandler for ExternalHandler {
    fn on_fault(&self, _context: &FaultContext, fault: &FaultScope) -> ChainAction {
        self.flush(fault);

        // The fault is not handled, the handler process takes it from here
        ChainAction::InvokePrevious
    }
}

/// Captures crashes with a separate handler process
#[derive(Default)]
pub struct ExternalBackend {
    host: Option<Arc<dyn Host>>,
    run: Option<Mutex<RunState>>,
    db: Mutex<Option<ReportDatabase>>,
    handler: Option<ExternalHandler>,
    process: Option<HandlerProcess>,
    attached: bool,
}

impl ExternalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the handler process was launched and our fault hook attached
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// The pid of the handler process, if it was launched
    #[inline]
    pub fn handler_pid(&self) -> Option<u32> {
        self.process.as_ref().map(HandlerProcess::pid)
    }

    /// The number of breadcrumbs written to the run files so far
    pub fn num_breadcrumbs(&self) -> usize {
        self.run.as_ref().map_or(0, |run| run.lock().num_breadcrumbs())
    }

    fn try_startup(&mut self, host: Arc<dyn Host>) -> Result<(), Error> {
        let options = host.options();

        // The handler path is resolved before anything else, if it can't be
        // found there's no point in doing anything else
        let handler_path = resolve_handler_path(options)?;

        let run = RunState::create(&options.run_path, options.max_breadcrumbs)?;

        // Make sure there is a reasonable event even if we crash before the
        // scope is next changed
        if let Err(err) = run.flush_scope(&*host) {
            log::debug!("failed to flush the initial scope: {err}");
        }

        let mut args = StartHandlerArgs::new(handler_path, &options.database_path);
        args.url = options.dsn.as_ref().map(|dsn| dsn.minidump_url());
        args.rate_limit = false;
        args.attachments = options.attachments.clone();
        args.attachments
            .extend(run.paths().into_iter().map(Path::to_path_buf));

        self.run = Some(Mutex::new(run));
        self.host = Some(host.clone());

        match ReportDatabase::initialize(&options.database_path) {
            Ok(db) => *self.db.lock() = Some(db),
            Err(err) => log::debug!("failed to initialize the report database: {err}"),
        }

        // The handler only reads the consent at launch
        self.user_consent_changed();

        self.process = Some(launcher::start_handler(args)?);

        crate::alloc::reserve();

        let handler = ExternalHandler { host: host.clone() };
        match chain::attach(Box::new(handler.clone())) {
            Ok(()) => self.attached = true,
            Err(err) => log::debug!("failed to install the first chance fault hook: {err}"),
        }
        self.handler = Some(handler);

        if !options.system_crash_reporter_enabled {
            if let Err(err) = crate::disable_system_crash_reporter() {
                log::debug!("failed to disable the system crash reporter: {err}");
            }
        }

        Ok(())
    }
}

impl Backend for ExternalBackend {
    fn startup(&mut self, host: Arc<dyn Host>) {
        if let Err(err) = self.try_startup(host) {
            log::debug!("failed to start the external crash handler: {err}");
        }
    }

    fn shutdown(&mut self) {
        if let Some(db) = self.db.lock().take() {
            db.close();
        }

        if let Some(process) = self.process.take() {
            process.detach();
        }

        if std::mem::take(&mut self.attached) {
            chain::detach();
        }

        // The run files are left on disk for the handler
        self.run = None;
        self.handler = None;
        self.host = None;
    }

    fn exception_hook(&self) -> Option<&dyn ExceptionHook> {
        Some(self)
    }

    fn state_hooks(&self) -> Option<&dyn StateHooks> {
        Some(self)
    }
}

impl ExceptionHook for ExternalBackend {
    fn handle_exception(&self, _context: &FaultContext) {
        if let Some(handler) = &self.handler {
            let fault = FaultScope::enter();
            handler.flush(&fault);
        }
    }
}

impl StateHooks for ExternalBackend {
    fn flush_scope(&self) {
        let (Some(host), Some(run)) = (&self.host, &self.run) else {
            return;
        };

        if let Err(err) = run.lock().flush_scope(&**host) {
            log::debug!("failed to flush scope: {err}");
        }
    }

    fn add_breadcrumb(&self, breadcrumb: Value) {
        let (Some(host), Some(run)) = (&self.host, &self.run) else {
            return;
        };

        if let Err(err) = run.lock().add_breadcrumb(&**host, &breadcrumb) {
            log::debug!("failed to add breadcrumb: {err}");
        }
    }

    fn user_consent_changed(&self) {
        let Some(host) = &self.host else {
            return;
        };

        let mut db = self.db.lock();
        if let Some(db) = db.as_mut() {
            if let Err(err) = db.set_uploads_enabled(!host.should_skip_upload()) {
                log::debug!("failed to update upload consent: {err}");
            }
        }
    }
}
