//! Locking that stays usable while a fault is being handled.
//!
//! A fault can interrupt a thread at any point, including while it holds a
//! lock that the fault handler itself needs. While a fault is being handled
//! on a thread, locks taken on that same thread stop blocking. They spin on
//! `try_lock` instead, and if the owner never releases the lock (because it
//! is the very thread that was interrupted), they fall back to unguarded
//! access.

use crate::FaultScope;
use std::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

static SIGNAL_DEPTH: AtomicUsize = AtomicUsize::new(0);
static HANDLING_THREAD: AtomicUsize = AtomicUsize::new(0);

/// The number of `try_lock` attempts made before giving up on the owner
const SPIN_LIMIT: u32 = 1 << 16;

pub(crate) fn enter_signal_handler() {
    HANDLING_THREAD.store(crate::current_thread_id(), Ordering::SeqCst);
    SIGNAL_DEPTH.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn leave_signal_handler() {
    let _ = SIGNAL_DEPTH.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
        depth.checked_sub(1)
    });
}

/// True while a fault is being handled on any thread
#[inline]
pub fn in_signal_handler() -> bool {
    SIGNAL_DEPTH.load(Ordering::SeqCst) > 0
}

/// Returns true if blocking synchronization may be used on the current thread.
///
/// This is only false on the thread that is currently handling a fault.
#[inline]
pub fn block_for_signal_handler() -> bool {
    !in_signal_handler() || HANDLING_THREAD.load(Ordering::SeqCst) != crate::current_thread_id()
}

/// A mutex that degrades to spin-waiting on the thread handling a fault
pub struct Mutex<T: ?Sized>(parking_lot::Mutex<T>);

pub enum MutexGuard<'lock, T: ?Sized> {
    Locked(parking_lot::MutexGuard<'lock, T>),
    /// The lock could not be acquired while handling a fault, the data is
    /// accessed without it
    Forced(&'lock mut T),
}

impl<T> Mutex<T> {
    #[inline]
    pub const fn new(val: T) -> Self {
        Self(parking_lot::const_mutex(val))
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, blocking the current thread until it is available.
    ///
    /// If called on a thread that is handling a fault, this behaves like
    /// [`Self::lock_in_fault`].
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if block_for_signal_handler() {
            MutexGuard::Locked(self.0.lock())
        } else {
            self.spin()
        }
    }

    /// Acquires the lock from within fault handling, never blocking
    #[inline]
    pub fn lock_in_fault(&self, _fault: &FaultScope) -> MutexGuard<'_, T> {
        self.spin()
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.0.try_lock().map(MutexGuard::Locked)
    }

    fn spin(&self) -> MutexGuard<'_, T> {
        for _ in 0..SPIN_LIMIT {
            if let Some(guard) = self.0.try_lock() {
                return MutexGuard::Locked(guard);
            }
            std::hint::spin_loop();
        }

        crate::debug_print!("lock owner never released, forcing access");
        // SAFETY: the only way to get here is from the thread handling a fault,
        // the lock owner has been interrupted and will not run again until the
        // fault handler returns, if it ever does
        MutexGuard::Forced(unsafe { &mut *self.0.data_ptr() })
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        match self {
            Self::Locked(guard) => guard,
            Self::Forced(data) => data,
        }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        match self {
            Self::Locked(guard) => guard,
            Self::Forced(data) => data,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blocks_outside_of_faults() {
        let lock = Mutex::new(1);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(matches!(guard, MutexGuard::Locked(_)));
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn fault_lock_does_not_deadlock() {
        let lock = Mutex::new(vec![1u32]);
        let held = lock.lock();

        let fault = FaultScope::enter();
        {
            let mut forced = lock.lock_in_fault(&fault);
            assert!(matches!(forced, MutexGuard::Forced(_)));
            forced.push(2);
        }
        fault.leave();

        drop(held);
        assert_eq!(*lock.lock(), [1, 2]);
    }
}
