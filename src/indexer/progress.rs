use std::sync::atomic::{AtomicU64, Ordering};

const UNSET: u64 = u64::MAX;

/// Height that only ever moves forward, tolerating out-of-order updates.
#[derive(Debug)]
pub struct HeightPointer {
    value: AtomicU64,
}

impl Default for HeightPointer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeightPointer {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(UNSET),
        }
    }

    /// Moves the pointer to `height` if it is strictly greater. Returns whether it moved.
    pub fn advance(&self, height: u64) -> bool {
        self.value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current == UNSET || height > current).then_some(height)
            })
            .is_ok()
    }

    pub fn get(&self) -> Option<u64> {
        match self.value.load(Ordering::SeqCst) {
            UNSET => None,
            value => Some(value),
        }
    }

    pub fn reset(&self) {
        self.value.store(UNSET, Ordering::SeqCst);
    }
}
