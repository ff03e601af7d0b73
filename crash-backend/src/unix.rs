pub mod chain;

use crate::{Error, SignalDescriptor};
use std::{mem, ptr};

pub(crate) const SIGNAL_COUNT: usize = 6;

/// The signals that are handled, in the order their previous dispositions
/// are saved in
pub static DESCRIPTORS: [SignalDescriptor; SIGNAL_COUNT] = [
    SignalDescriptor {
        code: libc::SIGILL,
        name: "SIGILL",
        description: "IllegalInstruction",
    },
    SignalDescriptor {
        code: libc::SIGTRAP,
        name: "SIGTRAP",
        description: "Trap",
    },
    SignalDescriptor {
        code: libc::SIGABRT,
        name: "SIGABRT",
        description: "Abort",
    },
    SignalDescriptor {
        code: libc::SIGBUS,
        name: "SIGBUS",
        description: "BusError",
    },
    SignalDescriptor {
        code: libc::SIGFPE,
        name: "SIGFPE",
        description: "FloatingPointException",
    },
    SignalDescriptor {
        code: libc::SIGSEGV,
        name: "SIGSEGV",
        description: "Segfault",
    },
];

/// The details of a signal, as handed to the signal handler by the kernel.
///
/// The pointers are only valid for the duration of the handling of a single
/// signal.
pub struct FaultContext {
    pub signum: i32,
    pub siginfo: *const libc::siginfo_t,
    /// The `ucontext_t` of the thread that received the signal, may be null
    /// for a synthetic context
    pub user_context: *const libc::c_void,
}

impl FaultContext {
    /// The signal number
    #[inline]
    pub fn code(&self) -> i32 {
        self.signum
    }

    /// The address of the instruction the thread was interrupted at, if
    /// there is a user context and it is known how to read it on this target
    pub fn instruction_pointer(&self) -> Option<usize> {
        if self.user_context.is_null() {
            return None;
        }

        let uc = self.user_context.cast::<libc::ucontext_t>();

        // SAFETY: a non-null user context is the ucontext_t the kernel
        // handed to the signal handler
        unsafe {
            cfg_if::cfg_if! {
                if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
                    Some((*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize)
                } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
                    Some((*uc).uc_mcontext.pc as usize)
                } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
                    Some((*(*uc).uc_mcontext).__ss.__rip as usize)
                } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
                    Some((*(*uc).uc_mcontext).__ss.__pc as usize)
                } else {
                    let _ = uc;
                    None
                }
            }
        }
    }
}

/// Runs `f` with a context for a signal that was never actually raised
pub fn with_synthetic_context<R>(signum: i32, f: impl FnOnce(&FaultContext) -> R) -> R {
    // SAFETY: POD
    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
    info.si_signo = signum;
    // SI_USER
    info.si_code = 0;

    f(&FaultContext {
        signum,
        siginfo: &info,
        user_context: ptr::null(),
    })
}

#[inline]
pub(crate) fn current_thread_id() -> usize {
    // SAFETY: syscall
    unsafe { libc::pthread_self() as usize }
}

/// Stops crashes from being forwarded to the system crash reporter by
/// disabling core dumps
pub(crate) fn disable_system_crash_reporter() -> Result<(), Error> {
    // SAFETY: syscalls
    unsafe {
        let mut limit: libc::rlimit = mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_CORE, &mut limit) == -1 {
            return Err(std::io::Error::last_os_error().into());
        }

        // Only lower the soft limit, so that the process can still opt back in
        limit.rlim_cur = 0;
        if libc::setrlimit(libc::RLIMIT_CORE, &limit) == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
    }

    Ok(())
}
