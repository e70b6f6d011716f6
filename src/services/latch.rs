use std::sync::atomic::{AtomicBool, Ordering};

/// Single-flight latch for the periodic tasks: at most one cycle runs at a
/// time, and the slot is freed on every exit path because release happens
/// in `Drop`.
#[derive(Debug, Default)]
pub struct Latch {
    busy: AtomicBool,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the latch. Returns `None` while a previous holder is
    /// still running.
    pub fn try_acquire(&self) -> Option<LatchGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LatchGuard { latch: self })
    }
}

pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.busy.store(false, Ordering::Release);
    }
}
