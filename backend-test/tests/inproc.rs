//! End to end tests of the in-process backend, the client faults for real
#![cfg(unix)]

mod shared;

use std::os::unix::process::ExitStatusExt;

fn crashes_with(fault: &str, signum: i32, name: &str) {
    let dir = shared::scratch_dir(fault);

    let status = shared::run_client(&dir, &["--backend", "inproc", "--fault", fault]);
    assert_eq!(
        status.signal(),
        Some(signum),
        "the client should have been killed by {name}, but {status}"
    );

    assert!(dir.join(backend_test::LAST_CRASH_FILE_NAME).is_file());

    let session = shared::read_values(&dir.join(backend_test::SESSION_FILE_NAME));
    assert_eq!(session[0]["status"], "crashed");

    let envelopes = shared::envelopes(&dir);
    assert_eq!(envelopes.len(), 1, "expected exactly one crash envelope");

    let event = &envelopes[0];
    assert_eq!(event["level"], "fatal");
    assert_eq!(event["tags"]["backend"], "inproc");

    let exc = &event["exception"]["values"][0];
    assert_eq!(exc["type"], name);
    assert_eq!(exc["mechanism"]["type"], "signalhandler");
    assert_eq!(exc["mechanism"]["meta"]["signal"]["number"], signum);

    let frames = exc["stacktrace"]["frames"].as_array().unwrap();
    assert!(!frames.is_empty());

    // The event queued before the crash was dumped to the run directory
    let queued = shared::read_values(&dir.join("run").join("queued-0.json"));
    assert_eq!(queued[0]["message"], "started");

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn segv() {
    crashes_with("segv", libc::SIGSEGV, "SIGSEGV");
}

#[test]
fn abort() {
    crashes_with("abort", libc::SIGABRT, "SIGABRT");
}

#[test]
fn trap() {
    crashes_with("trap", libc::SIGTRAP, "SIGTRAP");
}

#[test]
fn illegal_instruction() {
    crashes_with("ill", libc::SIGILL, "SIGILL");
}

#[cfg(target_os = "linux")]
#[test]
fn floating_point_exception() {
    crashes_with("fpe", libc::SIGFPE, "SIGFPE");
}

#[cfg(target_os = "linux")]
#[test]
fn bus_error() {
    crashes_with("bus", libc::SIGBUS, "SIGBUS");
}
