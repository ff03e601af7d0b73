//! Launching and supervising the external handler process

use crate::{Error, Options};
use std::{
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

/// The file name of the handler executable, next to the current executable,
/// when no explicit path is configured
pub const DEFAULT_HANDLER_NAME: &str = "crash-watchdog";

/// The number of times the handler is restarted if it exits while the
/// backend is still running
pub const MAX_RESTARTS: u32 = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resolves the handler executable to an absolute path of an existing file
pub fn resolve_handler_path(options: &Options) -> Result<PathBuf, Error> {
    let candidate = match &options.handler_path {
        Some(path) => path.clone(),
        None => {
            let exe = std::env::current_exe()?;
            let name = format!("{DEFAULT_HANDLER_NAME}{}", std::env::consts::EXE_SUFFIX);

            exe.parent()
                .map(|dir| dir.join(name))
                .ok_or(Error::InvalidHandlerPath(exe))?
        }
    };

    let absolute = std::path::absolute(&candidate)
        .map_err(|_err| Error::InvalidHandlerPath(candidate.clone()))?;

    if !absolute.is_file() {
        return Err(Error::InvalidHandlerPath(absolute));
    }

    Ok(absolute)
}

/// Everything the handler process is launched with
#[derive(Clone, Debug)]
pub struct StartHandlerArgs {
    pub handler: PathBuf,
    pub database: PathBuf,
    pub metrics_dir: PathBuf,
    /// Where captured reports are submitted to
    pub url: Option<String>,
    pub annotations: Vec<(String, String)>,
    pub attachments: Vec<PathBuf>,
    /// The process the handler watches
    pub monitor_pid: u32,
    pub rate_limit: bool,
}

impl StartHandlerArgs {
    pub fn new(handler: PathBuf, database: &Path) -> Self {
        Self {
            handler,
            database: database.to_owned(),
            metrics_dir: database.to_owned(),
            url: None,
            annotations: Vec::new(),
            attachments: Vec::new(),
            monitor_pid: std::process::id(),
            rate_limit: true,
        }
    }

    /// Builds the command that launches the handler
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.handler);

        cmd.arg("--database")
            .arg(&self.database)
            .arg("--metrics-dir")
            .arg(&self.metrics_dir);

        if let Some(url) = &self.url {
            cmd.arg("--url").arg(url);
        }

        cmd.arg("--handler")
            .arg(&self.handler)
            .arg("--monitor-pid")
            .arg(self.monitor_pid.to_string());

        if !self.rate_limit {
            cmd.arg("--no-rate-limit");
        }

        for (key, value) in &self.annotations {
            cmd.arg("--annotation").arg(format!("{key}={value}"));
        }

        for attachment in &self.attachments {
            cmd.arg("--attachment").arg(attachment);
        }

        cmd.stdin(Stdio::null());
        cmd
    }
}

/// A running handler process, restarted by a supervisor thread if it exits
/// early
pub struct HandlerProcess {
    pid: Arc<AtomicU32>,
    exit: Arc<AtomicBool>,
    supervisor: Option<std::thread::JoinHandle<()>>,
}

impl HandlerProcess {
    /// The pid of the current handler process
    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    /// Stops supervising the handler, which keeps running on its own
    pub fn detach(mut self) {
        self.stop_supervisor();
    }

    fn stop_supervisor(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
        if let Some(jh) = self.supervisor.take() {
            if jh.join().is_err() {
                log::debug!("handler supervisor panicked");
            }
        }
    }
}

impl Drop for HandlerProcess {
    fn drop(&mut self) {
        self.stop_supervisor();
    }
}

/// Launches the handler process. This only waits for the process to be
/// spawned, not for the handler to be ready.
pub fn start_handler(args: StartHandlerArgs) -> Result<HandlerProcess, Error> {
    let child = args.command().spawn().map_err(Error::HandlerLaunch)?;
    log::debug!(
        "started handler '{}' with pid {}",
        args.handler.display(),
        child.id()
    );

    let pid = Arc::new(AtomicU32::new(child.id()));
    let exit = Arc::new(AtomicBool::new(false));

    let supervisor = {
        let pid = pid.clone();
        let exit = exit.clone();

        std::thread::Builder::new()
            .name("crash-handler-supervisor".into())
            .spawn(move || supervise(child, &args, &exit, &pid))?
    };

    Ok(HandlerProcess {
        pid,
        exit,
        supervisor: Some(supervisor),
    })
}

fn supervise(mut child: Child, args: &StartHandlerArgs, exit: &AtomicBool, pid: &AtomicU32) {
    let mut restarts = 0;

    while !exit.load(Ordering::Relaxed) {
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                if restarts >= MAX_RESTARTS {
                    log::debug!("handler exited with {status}, giving up after {restarts} restarts");
                    return;
                }

                restarts += 1;
                log::debug!("handler exited with {status}, restarting ({restarts}/{MAX_RESTARTS})");

                match args.command().spawn() {
                    Ok(restarted) => {
                        pid.store(restarted.id(), Ordering::Relaxed);
                        child = restarted;
                    }
                    Err(err) => {
                        log::debug!("failed to restart handler: {err}");
                        return;
                    }
                }
            }
            Err(err) => {
                log::debug!("unable to poll handler process: {err}");
                return;
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn handler_arguments() {
        let mut args = StartHandlerArgs::new(PathBuf::from("/bin/handler"), Path::new("/db"));
        args.url = Some("https://example.com/api/1/minidump/?sentry_key=k".to_owned());
        args.rate_limit = false;
        args.annotations.push(("release".to_owned(), "1.0".to_owned()));
        args.attachments.push(PathBuf::from("/run/a"));
        args.attachments.push(PathBuf::from("/run/b"));
        args.monitor_pid = 42;

        let cmd = args.command();
        assert_eq!(cmd.get_program(), "/bin/handler");
        assert_eq!(
            args_of(&cmd),
            [
                "--database",
                "/db",
                "--metrics-dir",
                "/db",
                "--url",
                "https://example.com/api/1/minidump/?sentry_key=k",
                "--handler",
                "/bin/handler",
                "--monitor-pid",
                "42",
                "--no-rate-limit",
                "--annotation",
                "release=1.0",
                "--attachment",
                "/run/a",
                "--attachment",
                "/run/b",
            ]
        );
    }

    #[test]
    fn minimal_arguments() {
        let args = StartHandlerArgs::new(PathBuf::from("handler"), Path::new("db"));
        let argv = args_of(&args.command());

        assert!(!argv.iter().any(|arg| arg == "--url"));
        assert!(!argv.iter().any(|arg| arg == "--no-rate-limit"));
        assert!(argv.iter().any(|arg| arg == "--monitor-pid"));
    }

    #[test]
    fn unresolvable_handler() {
        let options = Options::default().with_handler_path("definitely/not/a/handler");

        match resolve_handler_path(&options) {
            Err(Error::InvalidHandlerPath(path)) => assert!(path.is_absolute()),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn resolves_existing_file() {
        let exe = std::env::current_exe().unwrap();
        let options = Options::default().with_handler_path(&exe);

        assert_eq!(resolve_handler_path(&options).unwrap(), exe);
    }
}
