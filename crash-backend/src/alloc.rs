//! An allocator that can be safely used from within a fault handler.
//!
//! The system allocator may hold internal locks, or have corrupted state, at
//! the time a fault occurs, so once fault handling begins every allocation is
//! served from a separate pool instead. The pool is a single anonymous mapping
//! reserved up front, carved up with an atomic bump pointer, and never freed.
//!
//! This only has an effect if [`EmergencyAllocator`] is installed as the
//! `#[global_allocator]`.
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: crash_backend::EmergencyAllocator = crash_backend::EmergencyAllocator::new(std::alloc::System);
//! ```

use std::{
    alloc::{GlobalAlloc, Layout, System},
    sync::atomic::{AtomicBool, Ordering},
};

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Switches all allocations made through [`EmergencyAllocator`] over to the
/// emergency pool. This cannot be undone.
#[inline]
pub fn enable() {
    #[cfg(unix)]
    pool::reserve();
    ENABLED.store(true, Ordering::SeqCst);
}

#[inline]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Reserves the emergency pool ahead of time, so that it does not need to be
/// mapped from within a fault handler
#[inline]
pub fn reserve() {
    #[cfg(unix)]
    pool::reserve();
}

/// Wraps another allocator, delegating to it until [`enable`] is called
pub struct EmergencyAllocator<A = System> {
    inner: A,
}

impl<A> EmergencyAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        unsafe impl<A: GlobalAlloc> GlobalAlloc for EmergencyAllocator<A> {
            #[inline]
            unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
                unsafe {
                    if is_enabled() {
                        pool::alloc(layout)
                    } else {
                        self.inner.alloc(layout)
                    }
                }
            }

            #[inline]
            unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
                unsafe {
                    if is_enabled() {
                        // Fresh anonymous pages are zeroed and pool memory is never reused
                        pool::alloc(layout)
                    } else {
                        self.inner.alloc_zeroed(layout)
                    }
                }
            }

            #[inline]
            unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
                // Memory from the pool is never returned, and memory from the
                // inner allocator is leaked once we're handling a fault, as
                // that allocator can no longer be trusted
                if pool::contains(ptr) || is_enabled() {
                    return;
                }

                unsafe { self.inner.dealloc(ptr, layout) }
            }

            unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
                unsafe {
                    if !pool::contains(ptr) && !is_enabled() {
                        return self.inner.realloc(ptr, layout, new_size);
                    }

                    let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
                    let new_ptr = pool::alloc(new_layout);
                    if !new_ptr.is_null() {
                        std::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                    }
                    new_ptr
                }
            }
        }

        mod pool {
            use std::{
                alloc::Layout,
                ptr,
                sync::atomic::{AtomicUsize, Ordering},
            };

            /// The amount of address space reserved for the pool, pages are only
            /// committed when they are actually touched
            pub(super) const POOL_SIZE: usize = 16 * 1024 * 1024;

            static BASE: AtomicUsize = AtomicUsize::new(0);
            static OFFSET: AtomicUsize = AtomicUsize::new(0);

            /// Maps the pool if it has not been already, returns the base address
            /// or 0 if the mapping failed
            pub(super) fn reserve() -> usize {
                let base = BASE.load(Ordering::Acquire);
                if base != 0 {
                    return base;
                }

                // SAFETY: syscalls
                unsafe {
                    let mapping = libc::mmap(
                        ptr::null_mut(),
                        POOL_SIZE,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANON,
                        -1,
                        0,
                    );
                    if mapping == libc::MAP_FAILED {
                        crate::debug_print!("failed to map emergency pool");
                        return 0;
                    }

                    match BASE.compare_exchange(
                        0,
                        mapping as usize,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => mapping as usize,
                        Err(winner) => {
                            // Somebody else reserved the pool first
                            libc::munmap(mapping, POOL_SIZE);
                            winner
                        }
                    }
                }
            }

            #[inline]
            pub(super) fn contains(ptr: *mut u8) -> bool {
                let base = BASE.load(Ordering::Acquire);
                base != 0 && (base..base + POOL_SIZE).contains(&(ptr as usize))
            }

            pub(super) fn alloc(layout: Layout) -> *mut u8 {
                let base = reserve();
                if base == 0 {
                    return ptr::null_mut();
                }

                let mut current = OFFSET.load(Ordering::Relaxed);
                loop {
                    let start = (base + current).next_multiple_of(layout.align()) - base;
                    let Some(end) = start.checked_add(layout.size().max(1)) else {
                        return ptr::null_mut();
                    };
                    if end > POOL_SIZE {
                        crate::debug_print!("emergency pool exhausted");
                        return ptr::null_mut();
                    }

                    match OFFSET.compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed) {
                        Ok(_) => return (base + start) as *mut u8,
                        Err(actual) => current = actual,
                    }
                }
            }
        }
    } else {
        unsafe impl<A: GlobalAlloc> GlobalAlloc for EmergencyAllocator<A> {
            #[inline]
            unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
                unsafe { self.inner.alloc(layout) }
            }

            #[inline]
            unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
                unsafe { self.inner.dealloc(ptr, layout) }
            }
        }
    }
}
