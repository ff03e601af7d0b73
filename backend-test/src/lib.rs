//! Test harness for the crash backends: a host client that keeps all of its
//! state in a directory, and the faults the `crash-client` can raise.

use crash_backend::{
    FaultScope, Host, Options, ScopeMode, SessionStatus, Transport, Value, sync::Mutex,
};
use serde_json::json;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

pub const LAST_CRASH_FILE_NAME: &str = "last_crash";
pub const SESSION_FILE_NAME: &str = "session.json";
pub const ENVELOPES_DIR_NAME: &str = "envelopes";

/// The transport that is active before a crash, it just keeps everything in
/// memory until it is dumped
struct QueueTransport {
    queue: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Transport for QueueTransport {
    fn dump_queue(&self, run_path: &Path) {
        let queue = std::mem::take(&mut *self.queue.lock());

        for (i, envelope) in queue.into_iter().enumerate() {
            // Nothing to be done about errors at this point
            let _ = fs::write(run_path.join(format!("queued-{i}.json")), envelope);
        }
    }
}

/// A host client with all of its state in a single directory
pub struct DirHost {
    options: Options,
    dir: PathBuf,
    scope: Mutex<Value>,
    queue: Arc<Mutex<Vec<Vec<u8>>>>,
    disk_transport: AtomicBool,
    envelope_count: AtomicUsize,
    consent: AtomicBool,
}

impl DirHost {
    pub fn new(dir: &Path, options: Options) -> anyhow::Result<Arc<Self>> {
        fs::create_dir_all(dir.join(ENVELOPES_DIR_NAME))?;
        fs::create_dir_all(&options.run_path)?;

        Ok(Arc::new(Self {
            options,
            dir: dir.to_owned(),
            scope: Mutex::new(json!({
                "user": { "id": std::process::id().to_string() },
                "tags": {},
                "breadcrumbs": [],
                "modules": {},
            })),
            queue: Arc::new(Mutex::new(Vec::new())),
            disk_transport: AtomicBool::new(false),
            envelope_count: AtomicUsize::new(0),
            consent: AtomicBool::new(true),
        }))
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn set_consent(&self, given: bool) {
        self.consent.store(given, Ordering::SeqCst);
    }

    pub fn set_tag(&self, key: &str, value: &str) {
        self.scope.lock()["tags"][key] = json!(value);
    }

    /// Records a breadcrumb in the scope, the backend is informed separately
    pub fn push_breadcrumb(&self, breadcrumb: Value) {
        if let Some(breadcrumbs) = self.scope.lock()["breadcrumbs"].as_array_mut() {
            breadcrumbs.push(breadcrumb);
        }
    }
}

impl Host for DirHost {
    fn options(&self) -> &Options {
        &self.options
    }

    fn write_crash_marker(&self, _fault: &FaultScope) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |dur| dur.as_secs());
        let _ = fs::write(self.dir.join(LAST_CRASH_FILE_NAME), timestamp.to_string());
    }

    fn enforce_disk_transport(&self, _fault: &FaultScope) -> Option<Box<dyn Transport>> {
        if self.disk_transport.swap(true, Ordering::SeqCst) {
            return None;
        }

        Some(Box::new(QueueTransport {
            queue: self.queue.clone(),
        }))
    }

    fn end_current_session_with_status(&self, status: SessionStatus) {
        let session = json!({ "status": status.as_str() });
        let _ = fs::write(self.dir.join(SESSION_FILE_NAME), self.encode(&session));
    }

    fn capture_event(&self, mut event: Value) {
        self.apply_scope(&mut event, ScopeMode::ALL);

        let envelope = self.encode(&event);
        if envelope.is_empty() {
            return;
        }

        if self.disk_transport.load(Ordering::SeqCst) {
            let n = self.envelope_count.fetch_add(1, Ordering::SeqCst);
            // This is called from within fault handling, so failures can't be
            // logged
            let _ = fs::write(
                self.dir.join(ENVELOPES_DIR_NAME).join(format!("{n}.json")),
                envelope,
            );
        } else {
            self.queue.lock().push(envelope);
        }
    }

    fn should_skip_upload(&self) -> bool {
        !self.consent.load(Ordering::SeqCst)
    }

    fn apply_scope(&self, event: &mut Value, mode: ScopeMode) {
        let scope = self.scope.lock();
        let (Value::Object(event), Value::Object(scope)) = (event, &*scope) else {
            return;
        };

        for (key, value) in scope {
            match key.as_str() {
                "breadcrumbs" if !mode.breadcrumbs => continue,
                "modules" if !mode.modules => continue,
                _ => {}
            }

            event.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

/// The faults the `crash-client` can raise
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Fault {
    Segv,
    Abort,
    Ill,
    Fpe,
    Trap,
    Bus,
}

impl Fault {
    /// Raises the fault, which is not expected to return
    pub fn raise(self) {
        match self {
            Self::Segv => raise_segfault(),
            Self::Abort => std::process::abort(),
            Self::Ill => raise_illegal_instruction(),
            Self::Fpe => raise_floating_point_exception(),
            Self::Trap => raise_trap(),
            Self::Bus => raise_bus(),
        }
    }
}

fn raise_segfault() {
    // Not null, but still in the first page which is never mapped
    let addr = 0x10 as *const u32;
    let value = unsafe { std::ptr::read_volatile(addr) };
    println!("read {value} from {addr:p}");
}

#[cfg(all(unix, not(all(target_os = "linux", target_arch = "x86_64"))))]
fn raise_signal(signum: i32) {
    unsafe {
        libc::raise(signum);
    }
}

fn raise_illegal_instruction() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("ud2");
    }

    #[cfg(all(unix, not(target_arch = "x86_64")))]
    raise_signal(libc::SIGILL);
}

fn raise_trap() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("int3");
    }

    #[cfg(all(unix, not(target_arch = "x86_64")))]
    raise_signal(libc::SIGTRAP);
}

fn raise_floating_point_exception() {
    #[cfg(target_arch = "x86_64")]
    {
        let quotient: u32;
        unsafe {
            std::arch::asm!(
                "mov eax, 1",
                "cdq",
                "mov {div:e}, 0",
                "idiv {div:e}",
                div = out(reg) _,
                out("eax") quotient,
                out("edx") _,
            );
        }
        println!("1 / 0 = {quotient}");
    }

    #[cfg(all(unix, not(target_arch = "x86_64")))]
    raise_signal(libc::SIGFPE);
}

fn raise_bus() {
    #[cfg(target_os = "linux")]
    unsafe {
        // Reading past the end of a file mapping raises SIGBUS
        let file = std::env::temp_dir().join(format!("bus-{}", uuid::Uuid::new_v4()));
        let Ok(path) = std::ffi::CString::new(file.to_string_lossy().as_bytes()) else {
            return;
        };

        let fd = libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o666);
        let mapping = libc::mmap(
            std::ptr::null_mut(),
            128,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        let value = std::ptr::read_volatile(mapping.cast::<u8>().add(1));
        println!("read {value}");
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    raise_signal(libc::SIGBUS);
}
