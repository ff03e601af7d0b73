use std::marker::PhantomData;

/// Proof that the current thread is handling a fault.
///
/// Entering a fault scope switches the [`crate::alloc`] emergency pool on and
/// marks the current thread as handling a fault so that [`crate::sync::Mutex`]
/// stops blocking on it. Every [`crate::Host`] method that is only called from
/// fault handling takes a `&FaultScope`, which keeps the fault path statically
/// apart from the normal one.
///
/// Leaving the scope (or dropping it) only clears the "handling a fault"
/// mark, the allocator stays in emergency mode for the remainder of the
/// process as the process is expected to terminate shortly. If it does not,
/// memory allocated from that point on is leaked.
pub struct FaultScope {
    // The mark is per-thread, so the scope must not migrate
    _not_send: PhantomData<*const ()>,
}

impl FaultScope {
    /// Enters fault handling on the current thread
    #[inline]
    pub fn enter() -> Self {
        crate::alloc::enable();
        crate::sync::enter_signal_handler();

        Self {
            _not_send: PhantomData,
        }
    }

    /// Leaves fault handling
    #[inline]
    pub fn leave(self) {}
}

impl Drop for FaultScope {
    fn drop(&mut self) {
        crate::sync::leave_signal_handler();
    }
}
