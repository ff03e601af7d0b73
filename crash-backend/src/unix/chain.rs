//! The process wide chain of signal handlers.
//!
//! [`attach`] saves the current disposition of every signal in
//! [`crate::DESCRIPTORS`] and installs our own handler in their place,
//! [`detach`] puts them back. When a signal arrives, the attached
//! [`FaultHandler`] is run, after which the saved dispositions are restored
//! and the saved handler for the signal is invoked, which for most signals
//! ends up terminating the process.

use super::SIGNAL_COUNT;
use crate::{DESCRIPTORS, Error, FaultContext, FaultHandler, FaultScope, sync::Mutex};
use std::{mem, ptr};

/// The size of the alternate stack the signal handler runs on. We need quite a
/// bit of space for unwinding and building the event.
pub const SIGNAL_STACK_SIZE: usize = 65536;

struct AltStack {
    new: libc::stack_t,
    old: libc::stack_t,
    mapping: *mut libc::c_void,
    mapping_size: usize,
}

impl AltStack {
    /// Create an alternative stack to run the signal handlers on. This is done
    /// since the signal might have been caused by a stack overflow.
    unsafe fn install() -> Result<Option<Self>, Error> {
        unsafe {
            // Check to see if the existing sigaltstack, and if it exists, is it big
            // enough. If so we don't need to allocate our own.
            let mut old: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut old) == -1 {
                return Err(std::io::Error::last_os_error().into());
            }

            if old.ss_flags & libc::SS_DISABLE == 0 && old.ss_size >= SIGNAL_STACK_SIZE {
                return Ok(None);
            }

            // ... but failing that we need to allocate our own, with a guard
            // page below it
            let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let mapping_size = guard_size + SIGNAL_STACK_SIZE;

            let mapping = libc::mmap(
                ptr::null_mut(),
                mapping_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(Error::OutOfMemory);
            }

            let stack_ptr = (mapping as usize + guard_size) as *mut libc::c_void;
            if libc::mprotect(
                stack_ptr,
                SIGNAL_STACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == -1
            {
                let err = std::io::Error::last_os_error();
                libc::munmap(mapping, mapping_size);
                return Err(err.into());
            }

            let new = libc::stack_t {
                ss_sp: stack_ptr,
                ss_flags: 0,
                ss_size: SIGNAL_STACK_SIZE,
            };
            if libc::sigaltstack(&new, ptr::null_mut()) == -1 {
                let err = std::io::Error::last_os_error();
                libc::munmap(mapping, mapping_size);
                return Err(err.into());
            }

            Ok(Some(Self {
                new,
                old,
                mapping,
                mapping_size,
            }))
        }
    }

    unsafe fn restore(self) {
        unsafe {
            // The alternate stack is per thread. If the current one is not
            // ours, we are either on a different thread than the one that
            // installed it, or someone replaced it, and either way it might
            // still be in use, so the mapping is leaked
            let mut current: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current) != 0 || current.ss_sp != self.new.ss_sp
            {
                return;
            }

            if self.old.ss_flags & libc::SS_DISABLE == 0 {
                libc::sigaltstack(&self.old, ptr::null_mut());
            } else {
                let mut disable: libc::stack_t = mem::zeroed();
                disable.ss_flags = libc::SS_DISABLE;
                libc::sigaltstack(&disable, ptr::null_mut());
            }

            let r = libc::munmap(self.mapping, self.mapping_size);
            debug_assert_eq!(r, 0, "munmap of the signal stack failed");
        }
    }
}

struct ChainState {
    /// The dispositions that were in place before ours, in the same order as
    /// [`DESCRIPTORS`]
    previous: [libc::sigaction; SIGNAL_COUNT],
    altstack: Option<AltStack>,
    handler: Box<dyn FaultHandler>,
}

// SAFETY: the raw pointers are only ever touched while holding the chain lock
unsafe impl Send for ChainState {}

impl ChainState {
    /// Restores all of the saved dispositions. If `only_ours` is true, signals
    /// whose disposition has been replaced by someone else since we attached
    /// are left alone.
    unsafe fn restore_dispositions(&self, only_ours: bool) {
        unsafe {
            for (desc, previous) in DESCRIPTORS.iter().zip(self.previous.iter()) {
                if only_ours {
                    let mut current: libc::sigaction = mem::zeroed();
                    if libc::sigaction(desc.code, ptr::null(), &mut current) == -1
                        || current.sa_sigaction != signal_handler as usize
                    {
                        continue;
                    }
                }

                if libc::sigaction(desc.code, previous, ptr::null_mut()) == -1 {
                    install_default_handler(desc.code);
                }
            }
        }
    }

    fn previous_for(&self, signum: i32) -> Option<libc::sigaction> {
        DESCRIPTORS
            .iter()
            .position(|desc| desc.code == signum)
            .map(|i| self.previous[i])
    }
}

static CHAIN: Mutex<Option<ChainState>> = Mutex::new(None);

/// Saves the current dispositions and installs our signal handler in their
/// place, running `handler` when one of the signals is raised.
///
/// Only one handler can be attached at a time.
pub fn attach(handler: Box<dyn FaultHandler>) -> Result<(), Error> {
    let mut lock = CHAIN.lock();

    if lock.is_some() {
        return Err(Error::HandlerAlreadyInstalled);
    }

    // SAFETY: syscalls
    unsafe {
        let altstack = AltStack::install()?;

        // Save all of the current handlers before touching any of them, so
        // that a failure leaves everything as it was
        let mut previous: [libc::sigaction; SIGNAL_COUNT] = mem::zeroed();
        for (desc, old) in DESCRIPTORS.iter().zip(previous.iter_mut()) {
            if libc::sigaction(desc.code, ptr::null(), old) == -1 {
                let err = std::io::Error::last_os_error();
                if let Some(altstack) = altstack {
                    altstack.restore();
                }
                return Err(err.into());
            }
        }

        install_handlers();

        *lock = Some(ChainState {
            previous,
            altstack,
            handler,
        });
    }

    log::debug!("attached signal handlers");
    Ok(())
}

/// Restores the dispositions saved by [`attach`], unless they have been
/// replaced by someone else in the meantime, and releases the alternate
/// signal stack
pub fn detach() {
    let mut lock = CHAIN.lock();

    if let Some(state) = lock.take() {
        // SAFETY: syscalls
        unsafe {
            state.restore_dispositions(true);
            if let Some(altstack) = state.altstack {
                altstack.restore();
            }
        }

        log::debug!("detached signal handlers");
    }
}

#[inline]
pub fn is_attached() -> bool {
    CHAIN.lock().is_some()
}

/// Restores the saved dispositions and invokes the handler that was
/// installed before ours for the signal in `context`, the same as happens
/// after a signal is handled. Does nothing if no chain is attached.
pub fn invoke_previous_handler(context: &FaultContext) {
    let previous = {
        let chain = CHAIN.lock();

        chain.as_ref().and_then(|state| {
            // SAFETY: syscalls
            unsafe { state.restore_dispositions(false) };
            state.previous_for(context.signum)
        })
    };

    if let Some(previous) = previous {
        // SAFETY: the context pointers are valid or null, which is what the
        // previous handler would have been handed by the kernel as well
        unsafe {
            invoke_previous(
                context.signum,
                &previous,
                context.siginfo.cast_mut(),
                context.user_context.cast_mut(),
            );
        }
    }
}

unsafe fn install_handlers() {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all handled signals while we're handling one of them
        for desc in &DESCRIPTORS {
            libc::sigaddset(&mut sa.sa_mask, desc.code);
        }

        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

        for desc in &DESCRIPTORS {
            // At this point it is impractical to back out changes, and so failure to
            // install a signal is intentionally ignored.
            let _ = libc::sigaction(desc.code, &sa, ptr::null_mut());
        }
    }
}

#[inline]
unsafe fn install_default_handler(signum: i32) {
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
    }
}

/// Invokes the handler that was installed before ours
unsafe fn invoke_previous(
    signum: i32,
    previous: &libc::sigaction,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        let handler = previous.sa_sigaction;

        if handler == libc::SIG_DFL {
            // The signal is masked until we return, at which point the
            // default action is taken
            libc::raise(signum);
        } else if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let action: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                mem::transmute(handler);
            action(signum, info, uc);
        } else if handler != libc::SIG_IGN {
            // This handler can only take the signal number (ANSI C)
            let action: extern "C" fn(libc::c_int) = mem::transmute(handler);
            action(signum);
        }
    }
}

/// This is the actual function installed for each signal we support, invoked
/// by the kernel
unsafe extern "C" fn signal_handler(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        // We might run inside a process where some other buggy code saves and
        // restores signal handlers temporarily with `signal` instead of `sigaction`.
        // This loses the `SA_SIGINFO` flag associated with this function. As a
        // consequence, the values of `info` and `uc` become totally bogus,
        // generally inducing a crash.
        //
        // When that is detected, reinstall the handler with the correct flags and
        // return, the kernel will deliver the signal again with the right arguments.
        {
            let mut current: libc::sigaction = mem::zeroed();
            if libc::sigaction(signum, ptr::null(), &mut current) == 0
                && current.sa_sigaction == signal_handler as usize
                && current.sa_flags & libc::SA_SIGINFO == 0
            {
                libc::sigemptyset(&mut current.sa_mask);
                libc::sigaddset(&mut current.sa_mask, signum);
                current.sa_sigaction = signal_handler as usize;
                current.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

                if libc::sigaction(signum, &current, ptr::null_mut()) == -1 {
                    install_default_handler(signum);
                }

                return;
            }
        }

        let context = FaultContext {
            signum,
            siginfo: info,
            user_context: uc,
        };

        let fault = FaultScope::enter();
        crate::debug_print!("entered signal handler");

        let previous = {
            let mut chain = CHAIN.lock_in_fault(&fault);

            chain.as_mut().and_then(|state| {
                // Both actions end up with the previous handler on unix
                let _action = state.handler.on_fault(&context, &fault);

                // Restore everything before invoking the previous handler, in
                // case it chooses to return and the fault occurs again. Note
                // that if the process does survive, the emergency allocator is
                // never switched back off.
                state.restore_dispositions(false);
                state.previous_for(signum)
            })
        };

        fault.leave();

        crate::debug_print!("invoking previous handler");
        match previous {
            Some(previous) => invoke_previous(signum, &previous, info, uc),
            None => {
                install_default_handler(signum);
                libc::raise(signum);
            }
        }
    }
}
