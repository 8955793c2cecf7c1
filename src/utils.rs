use std::cell::{Ref, RefCell, RefMut};
use std::thread::{self, ThreadId};

pub(crate) const DEFAULT_IO_THREADS: usize = 4;

/// Number of I/O threads worth running on this machine.
pub fn available_io_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_IO_THREADS)
}

/// State confined to the thread that runs one event loop.
///
/// The cell may be shared and dropped anywhere, but every borrow asserts
/// that it happens on the owning thread, so the inner `RefCell` is only
/// ever observed from a single thread.
pub(crate) struct LoopCell<T> {
    owner: ThreadId,
    value: RefCell<T>,
}

// SAFETY: every access to `value` goes through `check`, which panics on any
// thread other than `owner`. The value itself is `Send`, so moving the cell
// (and dropping it) on another thread is fine.
unsafe impl<T: Send> Sync for LoopCell<T> {}

impl<T> LoopCell<T> {
    pub(crate) fn new(owner: ThreadId, value: T) -> Self {
        Self {
            owner,
            value: RefCell::new(value),
        }
    }

    #[inline]
    fn check(&self) {
        let current = thread::current().id();
        assert!(
            current == self.owner,
            "loop-affine state owned by thread {:?} touched from thread {:?}",
            self.owner,
            current
        );
    }

    #[inline]
    pub(crate) fn borrow(&self) -> Ref<'_, T> {
        self.check();
        self.value.borrow()
    }

    #[inline]
    pub(crate) fn borrow_mut(&self) -> RefMut<'_, T> {
        self.check();
        self.value.borrow_mut()
    }
}
