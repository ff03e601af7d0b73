use backend_test::{DirHost, Fault};
use clap::Parser;
use crash_backend::{
    Backend, Dsn, EmergencyAllocator, ExternalBackend, Host, InProcBackend, Options,
};
use serde_json::json;
use std::path::PathBuf;

#[global_allocator]
static ALLOC: EmergencyAllocator = EmergencyAllocator::new(std::alloc::System);

#[derive(clap::ValueEnum, Clone, Copy)]
enum BackendKind {
    Inproc,
    External,
}

#[derive(Parser)]
struct Command {
    /// The backend to start
    #[clap(long, value_enum)]
    backend: BackendKind,
    /// The fault to raise once the backend is started
    #[clap(long, value_enum, default_value = "segv")]
    fault: Fault,
    /// The directory all of the host's state is kept in
    #[clap(long)]
    dir: PathBuf,
    /// Path to the handler executable for the external backend
    #[clap(long)]
    handler: Option<PathBuf>,
    /// The number of breadcrumbs to add before the fault
    #[clap(long, default_value_t = 0)]
    breadcrumbs: usize,
    /// The size of a breadcrumb rotation block
    #[clap(long, default_value_t = crash_backend::DEFAULT_MAX_BREADCRUMBS)]
    max_breadcrumbs: usize,
    /// The project credentials, used to derive the submission url
    #[clap(long)]
    dsn: Option<Dsn>,
    /// Revokes the upload consent before starting the backend
    #[clap(long)]
    no_consent: bool,
    /// Shuts the backend down and exits normally instead of faulting
    #[clap(long)]
    no_crash: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cmd = Command::parse();

    let mut options = Options::with_root(&cmd.dir)
        .with_max_breadcrumbs(cmd.max_breadcrumbs)
        .with_system_crash_reporter(false);
    if let Some(handler) = cmd.handler {
        options = options.with_handler_path(handler);
    }
    if let Some(dsn) = cmd.dsn {
        options = options.with_dsn(dsn);
    }

    let host = DirHost::new(&cmd.dir, options)?;
    host.set_consent(!cmd.no_consent);
    host.set_tag("backend", match cmd.backend {
        BackendKind::Inproc => "inproc",
        BackendKind::External => "external",
    });

    let mut backend: Box<dyn Backend> = match cmd.backend {
        BackendKind::Inproc => Box::new(InProcBackend::new()),
        BackendKind::External => Box::new(ExternalBackend::new()),
    };

    backend.startup(host.clone());
    println!("pid: {}", std::process::id());

    // Something for the transport to have queued when the fault occurs
    host.capture_event(json!({
        "level": "info",
        "message": "started",
    }));

    for n in 0..cmd.breadcrumbs {
        let breadcrumb = json!({ "message": format!("breadcrumb {n}"), "n": n });
        host.push_breadcrumb(breadcrumb.clone());

        if let Some(hooks) = backend.state_hooks() {
            hooks.add_breadcrumb(breadcrumb);
        }
    }

    host.set_tag("fault", &format!("{:?}", cmd.fault));
    if let Some(hooks) = backend.state_hooks() {
        hooks.flush_scope();
    }

    if cmd.no_crash {
        backend.shutdown();
        return Ok(());
    }

    cmd.fault.raise();

    anyhow::bail!("raising {:?} did not terminate the process", cmd.fault);
}
