//! A minimal stand-in for an external crash handler.
//!
//! It watches a single process, and once that process is gone writes a
//! report describing what it would have submitted into the database.

use clap::Parser;
use crash_backend::external::database;
use serde_json::json;
use std::{path::PathBuf, time::Duration};

#[derive(Parser, Debug)]
struct Command {
    /// The crash report database
    #[clap(long)]
    database: PathBuf,
    #[clap(long)]
    metrics_dir: Option<PathBuf>,
    /// Where reports are submitted to
    #[clap(long)]
    url: Option<String>,
    /// The path this handler was launched from
    #[clap(long)]
    handler: Option<PathBuf>,
    /// The process to watch
    #[clap(long)]
    monitor_pid: u32,
    #[clap(long)]
    no_rate_limit: bool,
    /// `key=value` pairs added to every report
    #[clap(long = "annotation")]
    annotations: Vec<String>,
    /// Files attached to every report
    #[clap(long = "attachment")]
    attachments: Vec<PathBuf>,
}

#[cfg(unix)]
fn wait_for_exit(pid: u32) {
    loop {
        // SAFETY: syscall, signal 0 only checks for existence
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0
            || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);

        if !alive {
            return;
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(windows)]
fn wait_for_exit(pid: u32) {
    use windows_sys::Win32::{
        Foundation::CloseHandle,
        System::Threading::{INFINITE, OpenProcess, PROCESS_SYNCHRONIZE, WaitForSingleObject},
    };

    // SAFETY: syscalls
    unsafe {
        let process = OpenProcess(PROCESS_SYNCHRONIZE, 0, pid);
        if process.is_null() {
            return;
        }

        WaitForSingleObject(process, INFINITE);
        CloseHandle(process);
    }

    // Give the process some time to settle its files
    std::thread::sleep(Duration::from_millis(50));
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cmd = Command::parse();
    log::debug!(
        "watching {} for handler {:?}, metrics in {:?}",
        cmd.monitor_pid,
        cmd.handler,
        cmd.metrics_dir
    );

    // The settings are only read once, at launch
    let settings = database::read_settings(&cmd.database)?;

    wait_for_exit(cmd.monitor_pid);

    let attachments: Vec<_> = cmd
        .attachments
        .iter()
        .filter_map(|path| {
            let md = std::fs::metadata(path).ok()?;
            Some(json!({
                "path": path,
                "size": md.len(),
            }))
        })
        .collect();

    let annotations: serde_json::Map<String, serde_json::Value> = cmd
        .annotations
        .iter()
        .filter_map(|annotation| annotation.split_once('='))
        .map(|(key, value)| (key.to_owned(), json!(value)))
        .collect();

    let report_id = uuid::Uuid::new_v4();
    let report = json!({
        "id": report_id,
        "client_id": settings.client_id,
        "monitored_pid": cmd.monitor_pid,
        "url": cmd.url,
        "uploads_enabled": settings.uploads_enabled,
        "rate_limited": !cmd.no_rate_limit,
        "annotations": annotations,
        "attachments": attachments,
    });

    let path = cmd
        .database
        .join(database::REPORTS_DIR_NAME)
        .join(format!("{report_id}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(&report)?)?;

    log::info!("wrote report '{}'", path.display());
    Ok(())
}
