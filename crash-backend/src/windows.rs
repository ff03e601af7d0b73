pub mod chain;

use crate::{Error, SignalDescriptor};
use std::ptr;
use windows_sys::Win32::{
    Foundation as found,
    System::Diagnostics::Debug::{EXCEPTION_POINTERS, EXCEPTION_RECORD},
};

unsafe extern "system" {
    fn GetCurrentThreadId() -> u32;
    fn GetErrorMode() -> u32;
    fn SetErrorMode(mode: u32) -> u32;
}

const SEM_FAILCRITICALERRORS: u32 = 0x0001;
const SEM_NOGPFAULTERRORBOX: u32 = 0x0002;

macro_rules! exception {
    ($code:ident, $desc:literal) => {
        SignalDescriptor {
            code: found::$code,
            name: stringify!($code),
            description: $desc,
        }
    };
}

/// The exception codes that are described, all other codes are reported as
/// unknown
pub static DESCRIPTORS: [SignalDescriptor; 20] = [
    exception!(EXCEPTION_ACCESS_VIOLATION, "AccessViolation"),
    exception!(EXCEPTION_ARRAY_BOUNDS_EXCEEDED, "ArrayBoundsExceeded"),
    exception!(EXCEPTION_BREAKPOINT, "BreakPoint"),
    exception!(EXCEPTION_DATATYPE_MISALIGNMENT, "DatatypeMisalignment"),
    exception!(EXCEPTION_FLT_DENORMAL_OPERAND, "FloatDenormalOperand"),
    exception!(EXCEPTION_FLT_DIVIDE_BY_ZERO, "FloatDivideByZero"),
    exception!(EXCEPTION_FLT_INEXACT_RESULT, "FloatInexactResult"),
    exception!(EXCEPTION_FLT_INVALID_OPERATION, "FloatInvalidOperation"),
    exception!(EXCEPTION_FLT_OVERFLOW, "FloatOverflow"),
    exception!(EXCEPTION_FLT_STACK_CHECK, "FloatStackCheck"),
    exception!(EXCEPTION_FLT_UNDERFLOW, "FloatUnderflow"),
    exception!(EXCEPTION_ILLEGAL_INSTRUCTION, "IllegalInstruction"),
    exception!(EXCEPTION_IN_PAGE_ERROR, "InPageError"),
    exception!(EXCEPTION_INT_DIVIDE_BY_ZERO, "IntegerDivideByZero"),
    exception!(EXCEPTION_INT_OVERFLOW, "IntegerOverflow"),
    exception!(EXCEPTION_INVALID_DISPOSITION, "InvalidDisposition"),
    exception!(EXCEPTION_NONCONTINUABLE_EXCEPTION, "NonContinuableException"),
    exception!(EXCEPTION_PRIV_INSTRUCTION, "PrivilegedInstruction"),
    exception!(EXCEPTION_SINGLE_STEP, "SingleStep"),
    exception!(EXCEPTION_STACK_OVERFLOW, "StackOverflow"),
];

/// The exception pointers handed to the top level exception filter
pub struct FaultContext {
    pub exception_pointers: *const EXCEPTION_POINTERS,
}

impl FaultContext {
    /// The exception code, or 0 if there is no exception record
    pub fn code(&self) -> i32 {
        // SAFETY: the pointers are either null or valid for the lifetime of
        // the context
        unsafe {
            self.exception_pointers
                .as_ref()
                .and_then(|ep| ep.ExceptionRecord.as_ref())
                .map_or(0, |record| record.ExceptionCode)
        }
    }

    /// The address of the instruction the exception was raised at, if there
    /// is a thread context
    pub fn instruction_pointer(&self) -> Option<usize> {
        // SAFETY: the pointers are either null or valid for the lifetime of
        // the context
        let context = unsafe { self.exception_pointers.as_ref()?.ContextRecord.as_ref()? };

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                Some(context.Rip as usize)
            } else if #[cfg(target_arch = "aarch64")] {
                Some(context.Pc as usize)
            } else if #[cfg(target_arch = "x86")] {
                Some(context.Eip as usize)
            } else {
                let _ = context;
                None
            }
        }
    }
}

/// Runs `f` with a context for an exception that was never actually raised.
/// The context has an exception record, but no thread context.
pub fn with_synthetic_context<R>(code: i32, f: impl FnOnce(&FaultContext) -> R) -> R {
    // SAFETY: POD
    let mut record: EXCEPTION_RECORD = unsafe { std::mem::zeroed() };
    record.ExceptionCode = code;

    let pointers = EXCEPTION_POINTERS {
        ExceptionRecord: &mut record,
        ContextRecord: ptr::null_mut(),
    };

    f(&FaultContext {
        exception_pointers: &pointers,
    })
}

#[inline]
pub(crate) fn current_thread_id() -> usize {
    // SAFETY: syscall
    unsafe { GetCurrentThreadId() as usize }
}

#[inline]
fn add_error_mode(flags: u32) {
    // SAFETY: syscalls
    unsafe {
        SetErrorMode(GetErrorMode() | flags);
    }
}

/// Stops the OS from showing a dialog for critical errors
pub(crate) fn suppress_crash_dialogs() {
    add_error_mode(SEM_FAILCRITICALERRORS);
}

/// Stops crashes from being forwarded to Windows Error Reporting
pub(crate) fn disable_system_crash_reporter() -> Result<(), Error> {
    add_error_mode(SEM_NOGPFAULTERRORBOX);
    Ok(())
}
