//! Process-wide monotonic sequence source.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out 63-bit integers starting at 0. Every consumer (validation
/// tickets, stream indices, any per-event identifier) pulls from the same
/// source, so a value is given out exactly once and never reused within the
/// process lifetime.
#[derive(Debug, Default)]
pub struct SequenceSource(AtomicU64);

impl SequenceSource {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        let n = self.0.fetch_add(1, Ordering::Relaxed);
        debug_assert!(n < (1 << 63));
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn starts_at_zero_and_increments() {
        let seqs = SequenceSource::new();
        assert_eq!(seqs.next(), 0);
        assert_eq!(seqs.next(), 1);
        assert_eq!(seqs.next(), 2);
    }

    #[test]
    fn values_are_unique_across_threads() {
        let seqs = Arc::new(SequenceSource::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let seqs = seqs.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| seqs.next()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "sequence value {v} handed out twice");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
