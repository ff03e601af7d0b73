//! End to end tests of the external backend with the `crash-watchdog` as the
//! handler process

mod shared;

use crash_backend::external::{database, run_state};

const DSN: &str = "https://key@127.0.0.1:9/42";

#[test]
fn startup_and_rotation() {
    let dir = shared::scratch_dir("external");

    let status = shared::run_client(
        &dir,
        &[
            "--backend",
            "external",
            "--handler",
            shared::watchdog_path(),
            "--dsn",
            DSN,
            "--breadcrumbs",
            "2",
            "--max-breadcrumbs",
            "1",
            "--no-crash",
        ],
    );
    assert!(status.success(), "{status}");

    let run = dir.join("run");
    let db = dir.join("db");

    // One breadcrumb per block, so each file holds exactly one
    let first = shared::read_values(&run.join(run_state::BREADCRUMB1_FILE_NAME));
    assert_eq!(first.len(), 1);
    assert_eq!(first[0]["n"], 0);

    let second = shared::read_values(&run.join(run_state::BREADCRUMB2_FILE_NAME));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0]["n"], 1);

    let event = shared::read_values(&run.join(run_state::EVENT_FILE_NAME));
    assert_eq!(event.len(), 1);
    assert_eq!(event[0]["tags"]["backend"], "external");
    assert_eq!(event[0]["tags"]["fault"], "Segv");
    assert!(event[0].get("breadcrumbs").is_none());
    assert!(event[0].get("modules").is_none());

    let settings = database::read_settings(&db).unwrap();
    assert!(settings.uploads_enabled);

    // The watchdog writes its report once the client is gone
    let report = shared::wait_for_report(&db);
    assert_eq!(report["uploads_enabled"], true);
    assert_eq!(report["rate_limited"], false);
    assert_eq!(
        report["url"],
        "https://127.0.0.1:9/api/42/minidump/?sentry_key=key"
    );
    assert_eq!(report["client_id"], settings.client_id.to_string());

    let attachments: Vec<_> = report["attachments"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|attachment| attachment["path"].as_str())
        .collect();
    for name in [
        run_state::EVENT_FILE_NAME,
        run_state::BREADCRUMB1_FILE_NAME,
        run_state::BREADCRUMB2_FILE_NAME,
    ] {
        assert!(
            attachments.iter().any(|path| path.ends_with(name)),
            "{name} was not attached"
        );
    }

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn consent_is_synced_before_launch() {
    let dir = shared::scratch_dir("consent");

    let status = shared::run_client(
        &dir,
        &[
            "--backend",
            "external",
            "--handler",
            shared::watchdog_path(),
            "--no-consent",
            "--no-crash",
        ],
    );
    assert!(status.success(), "{status}");

    let db = dir.join("db");
    assert!(!database::read_settings(&db).unwrap().uploads_enabled);

    let report = shared::wait_for_report(&db);
    assert_eq!(report["uploads_enabled"], false);
    assert!(report["url"].is_null());

    let _ = std::fs::remove_dir_all(dir);
}

#[cfg(unix)]
#[test]
fn crash_is_flushed_then_passed_on() {
    use std::os::unix::process::ExitStatusExt;

    let dir = shared::scratch_dir("external-crash");

    let status = shared::run_client(
        &dir,
        &[
            "--backend",
            "external",
            "--handler",
            shared::watchdog_path(),
            "--fault",
            "segv",
        ],
    );
    assert_eq!(status.signal(), Some(libc::SIGSEGV), "{status}");

    assert!(dir.join(backend_test::LAST_CRASH_FILE_NAME).is_file());

    let session = shared::read_values(&dir.join(backend_test::SESSION_FILE_NAME));
    assert_eq!(session[0]["status"], "crashed");

    // The crash itself is captured by the handler, not the client
    assert!(shared::envelopes(&dir).is_empty());

    let queued = shared::read_values(&dir.join("run").join("queued-0.json"));
    assert_eq!(queued[0]["message"], "started");

    let report = shared::wait_for_report(&dir.join("db"));
    assert!(report["attachments"].as_array().is_some_and(|a| a.len() >= 3));

    let _ = std::fs::remove_dir_all(dir);
}
