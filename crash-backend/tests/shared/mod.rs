#![allow(dead_code)]

use crash_backend::{
    FaultScope, Host, Options, ScopeMode, SessionStatus, Transport, Value, sync::Mutex,
};
use serde_json::json;
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

/// Attaching the handler chain is process wide, so tests that do it must
/// not run concurrently
pub static CHAIN_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Detaches the handler chain when dropped, so that a failed assertion
/// doesn't leave it attached for the next test
pub struct DetachOnDrop;

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        crash_backend::chain::detach();
    }
}

pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("crash-backend-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("failed to create scratch directory");
    dir
}

struct QueueTransport {
    dumps: Arc<AtomicUsize>,
}

impl Transport for QueueTransport {
    fn dump_queue(&self, _run_path: &Path) {
        self.dumps.fetch_add(1, Ordering::SeqCst);
    }
}

/// A host that records everything the backend does with it
pub struct TestHost {
    options: Options,
    pub markers: AtomicUsize,
    pub events: Mutex<Vec<Value>>,
    pub session: Mutex<Option<SessionStatus>>,
    pub scope: Mutex<Value>,
    pub skip_upload: AtomicBool,
    /// The number of times the queue of the original transport was dumped
    pub dumps: Arc<AtomicUsize>,
    disk_transport: AtomicBool,
}

impl TestHost {
    pub fn new(options: Options) -> Arc<Self> {
        Arc::new(Self {
            options,
            markers: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            scope: Mutex::new(json!({
                "user": { "id": "42" },
                "tags": { "os": std::env::consts::OS },
                "breadcrumbs": [{ "message": "scoped" }],
                "modules": { "crash-backend": "0.1.0" },
            })),
            skip_upload: AtomicBool::new(false),
            dumps: Arc::new(AtomicUsize::new(0)),
            disk_transport: AtomicBool::new(false),
        })
    }

    pub fn last_event(&self) -> Value {
        self.events.lock().last().cloned().expect("no event was captured")
    }
}

impl Host for TestHost {
    fn options(&self) -> &Options {
        &self.options
    }

    fn write_crash_marker(&self, _fault: &FaultScope) {
        self.markers.fetch_add(1, Ordering::SeqCst);
    }

    fn enforce_disk_transport(&self, _fault: &FaultScope) -> Option<Box<dyn Transport>> {
        if self.disk_transport.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Box::new(QueueTransport {
                dumps: self.dumps.clone(),
            }))
        }
    }

    fn end_current_session_with_status(&self, status: SessionStatus) {
        *self.session.lock() = Some(status);
    }

    fn capture_event(&self, event: Value) {
        self.events.lock().push(event);
    }

    fn should_skip_upload(&self) -> bool {
        self.skip_upload.load(Ordering::SeqCst)
    }

    /// Copies the entire scope, ignoring the mode, the backend is expected to
    /// strip what it doesn't want
    fn apply_scope(&self, event: &mut Value, _mode: ScopeMode) {
        let scope = self.scope.lock();

        if let (Value::Object(event), Value::Object(scope)) = (event, &*scope) {
            for (key, value) in scope {
                event.insert(key.clone(), value.clone());
            }
        }
    }
}
