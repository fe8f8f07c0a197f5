use crate::clock;
use std::sync::atomic::{AtomicU64, Ordering};

const COUNTER_BITS: u32 = 16;

/// Issues strictly increasing timestamps: wall clock millis in the high bits, a counter in the
/// low 16. When the wall clock stalls or steps back, the counter keeps timestamps moving and
/// eventually borrows from the millisecond part.
///
/// The oracle is process-local; a cell's leader is the only replica that hands out timestamps.
pub struct MonotonicTimestampProvider {
    last_issued: AtomicU64,
    wall_clock: fn() -> u64,
}

impl MonotonicTimestampProvider {
    pub fn new() -> Self {
        Self::with_wall_clock(clock::wall_clock_millis)
    }

    pub(crate) fn with_wall_clock(wall_clock: fn() -> u64) -> Self {
        MonotonicTimestampProvider {
            last_issued: AtomicU64::new(0),
            wall_clock,
        }
    }

    pub fn generate_timestamp(&self) -> u64 {
        let floor = (self.wall_clock)() << COUNTER_BITS;
        let previous = self
            .last_issued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(if floor > last { floor } else { last + 1 })
            })
            .unwrap_or_else(|last| last);

        if floor > previous {
            floor
        } else {
            previous + 1
        }
    }

    pub fn latest_timestamp(&self) -> u64 {
        self.last_issued.load(Ordering::SeqCst)
    }
}

impl Default for MonotonicTimestampProvider {
    fn default() -> Self {
        Self::new()
    }
}
