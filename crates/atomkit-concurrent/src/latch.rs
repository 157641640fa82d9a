use std::fmt;

use atomkit_core::{AtomicError, Result};
use tracing::trace;

use crate::atom::AtomicReference;
use crate::spin::spin_until;

/// One-shot countdown barrier. The count starts positive, only ever goes
/// down by one per successful [`count_down`](Self::count_down), and never
/// goes below zero.
pub struct AtomicCountDownLatch {
    count: AtomicReference<usize>,
}

impl AtomicCountDownLatch {
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(AtomicError::InvalidCount(
                "count must be a positive integer".into(),
            ));
        }
        Ok(Self {
            count: AtomicReference::new(count),
        })
    }

    pub fn count(&self) -> usize {
        self.count.peek(|c| *c)
    }

    /// Decrement by one and return the new count.
    ///
    /// Fails with [`AtomicError::AlreadyCountedDown`] when the count is
    /// already zero; the latch is left as it was.
    pub fn count_down(&self) -> Result<usize> {
        let mut already_zero = false;
        let new_count = self.count.swap(|&current| {
            // Reassigned on every attempt; only the winning attempt's value
            // survives the loop.
            already_zero = current == 0;
            current.saturating_sub(1)
        });
        if already_zero {
            return Err(AtomicError::AlreadyCountedDown);
        }
        Ok(*new_count)
    }

    /// Block (spinning) until the count reaches zero.
    pub fn wait(&self) {
        let polls = spin_until(|| self.count() == 0);
        trace!(polls, "latch released");
    }
}

impl fmt::Debug for AtomicCountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicCountDownLatch")
            .field("count", &self.count())
            .finish()
    }
}
