//! The process wide top level exception filter.
//!
//! Windows delivers every unhandled exception to a single filter, so unlike
//! unix there is only one previous handler to keep track of.

use crate::{ChainAction, Error, FaultContext, FaultHandler, FaultScope, sync::Mutex};
use windows_sys::Win32::{Foundation as found, System::Diagnostics::Debug::EXCEPTION_POINTERS};

type TopLevelFilter =
    Option<unsafe extern "system" fn(exceptioninfo: *const EXCEPTION_POINTERS) -> i32>;

unsafe extern "system" {
    fn SetUnhandledExceptionFilter(filter: TopLevelFilter) -> TopLevelFilter;
}

const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

struct ChainState {
    /// The filter that was installed before ours
    previous_filter: TopLevelFilter,
    handler: Box<dyn FaultHandler>,
}

static CHAIN: Mutex<Option<ChainState>> = Mutex::new(None);

#[inline]
fn is_ours(filter: TopLevelFilter) -> bool {
    filter.is_some_and(|filter| filter as usize == handle_exception as usize)
}

/// Installs our top level exception filter, running `handler` when an
/// exception goes unhandled.
///
/// Only one handler can be attached at a time.
pub fn attach(handler: Box<dyn FaultHandler>) -> Result<(), Error> {
    let mut lock = CHAIN.lock();

    if lock.is_some() {
        return Err(Error::HandlerAlreadyInstalled);
    }

    // SAFETY: syscall
    let previous_filter = unsafe { SetUnhandledExceptionFilter(Some(handle_exception)) };

    *lock = Some(ChainState {
        previous_filter,
        handler,
    });

    log::debug!("attached exception filter");
    Ok(())
}

/// Restores the filter that was active before [`attach`], but only if ours
/// has not been replaced since
pub fn detach() {
    let mut lock = CHAIN.lock();

    if let Some(state) = lock.take() {
        // SAFETY: syscalls
        unsafe {
            // There is no way to query the current filter without replacing it
            let current = SetUnhandledExceptionFilter(state.previous_filter);
            if !is_ours(current) {
                SetUnhandledExceptionFilter(current);
            }
        }

        log::debug!("detached exception filter");
    }
}

#[inline]
pub fn is_attached() -> bool {
    CHAIN.lock().is_some()
}

unsafe extern "system" fn handle_exception(exception_info: *const EXCEPTION_POINTERS) -> i32 {
    let context = FaultContext {
        exception_pointers: exception_info,
    };

    // Debugger events are not crashes
    let code = context.code();
    if code == found::EXCEPTION_BREAKPOINT || code == found::EXCEPTION_SINGLE_STEP {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let fault = FaultScope::enter();
    crate::debug_print!("entered exception filter");

    let next = {
        let chain = CHAIN.lock_in_fault(&fault);

        chain.as_ref().and_then(|state| {
            match state.handler.on_fault(&context, &fault) {
                ChainAction::InvokePrevious => state.previous_filter,
                ChainAction::ContinueSearch => None,
            }
        })
    };

    fault.leave();

    match next {
        // SAFETY: the previous filter was installed by someone who expects it
        // to be called with these arguments
        Some(previous) => unsafe { previous(exception_info) },
        None => EXCEPTION_CONTINUE_SEARCH,
    }
}
