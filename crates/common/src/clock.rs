//! Process-monotone logical clock.
//!
//! Stamps are wall-clock milliseconds bumped to `last + 1` whenever the
//! wall clock stalls or steps backwards, so within a single process
//! lifetime every stamp is strictly greater than the previous one.
//! Replicas resolve concurrent writes by highest clock, then checksum.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stamp: `max(wall_millis, last + 1)`.
    pub fn next(&self) -> u64 {
        let wall = crate::wall_clock_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_monotone() {
        let clock = LogicalClock::new();
        let mut prev = 0;
        for _ in 0..10_000 {
            let next = clock.next();
            assert!(next > prev, "clock went backwards: {} -> {}", prev, next);
            prev = next;
        }
    }

    #[test]
    fn test_monotone_across_threads() {
        use std::sync::Arc;

        let clock = Arc::new(LogicalClock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| clock.next()).collect::<Vec<u64>>()
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "stamps must be unique process-wide");
    }
}
