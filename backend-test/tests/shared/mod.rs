#![allow(dead_code)]

use crash_backend::Value;
use std::{
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    time::{Duration, Instant},
};

pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("backend-test-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("failed to create scratch directory");
    dir
}

#[inline]
pub fn watchdog_path() -> &'static str {
    env!("CARGO_BIN_EXE_crash-watchdog")
}

/// Runs the `crash-client` with its state in `dir`.
///
/// The output is inherited rather than captured, as the handler process the
/// client spawns inherits it as well, and outlives the client.
pub fn run_client(dir: &Path, args: &[&str]) -> ExitStatus {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_crash-client"));
    cmd.arg("--dir").arg(dir).args(args);

    cmd.status().expect("failed to run crash-client")
}

/// Reads all of the JSON values concatenated in a file
pub fn read_values(path: &Path) -> Vec<Value> {
    let buf = std::fs::read(path)
        .unwrap_or_else(|err| panic!("failed to read '{}': {err}", path.display()));

    serde_json::Deserializer::from_slice(&buf)
        .into_iter::<Value>()
        .collect::<Result<_, _>>()
        .expect("invalid JSON")
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(rd) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut files: Vec<_> = rd
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

/// The envelopes the host wrote to disk
pub fn envelopes(dir: &Path) -> Vec<Value> {
    json_files(&dir.join(backend_test::ENVELOPES_DIR_NAME))
        .iter()
        .flat_map(|path| read_values(path))
        .collect()
}

/// Waits for the handler to write a report into the database
pub fn wait_for_report(db_path: &Path) -> Value {
    let reports = db_path.join(crash_backend::external::database::REPORTS_DIR_NAME);
    let start = Instant::now();

    loop {
        if let Some(path) = json_files(&reports).first() {
            // The report might still be being written
            let report = std::fs::read(path)
                .ok()
                .and_then(|buf| serde_json::from_slice(&buf).ok());
            if let Some(report) = report {
                return report;
            }
        }

        assert!(
            start.elapsed() < Duration::from_secs(10),
            "timed out waiting for a report in '{}'",
            reports.display()
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}
