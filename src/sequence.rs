use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out outbound sequence numbers `1..=max`, wrapping around to 1. Safe to share between
///  the client loop and simulation threads sending packets.
pub struct SequenceAllocator {
    last: AtomicU32,
    max: u32,
}

impl SequenceAllocator {
    pub fn new(max: u32) -> SequenceAllocator {
        SequenceAllocator {
            last: AtomicU32::new(0),
            max,
        }
    }

    pub fn next(&self) -> u32 {
        let successor = |last: u32| if last >= self.max { 1 } else { last + 1 };

        let previous = self.last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(successor(last)))
            .unwrap_or_else(|last| last);
        successor(previous)
    }

    /// the most recently allocated number, 0 if none was allocated yet
    pub fn last(&self) -> u32 {
        self.last.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn starting_after(max: u32, last: u32) -> SequenceAllocator {
        SequenceAllocator {
            last: AtomicU32::new(last),
            max,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use crate::config::MAX_SEQUENCE;
    use super::*;

    #[test]
    fn test_monotonic() {
        let allocator = SequenceAllocator::new(MAX_SEQUENCE);
        assert_eq!(allocator.last(), 0);
        for expected in 1..=1000 {
            assert_eq!(allocator.next(), expected);
        }
        assert_eq!(allocator.last(), 1000);
    }

    #[test]
    fn test_wraps_to_one() {
        let allocator = SequenceAllocator::starting_after(MAX_SEQUENCE, MAX_SEQUENCE - 2);
        assert_eq!(allocator.next(), MAX_SEQUENCE - 1);
        assert_eq!(allocator.next(), MAX_SEQUENCE);
        assert_eq!(allocator.next(), 1);
        assert_eq!(allocator.next(), 2);
    }

    #[test]
    fn test_full_cycle_with_small_max() {
        let allocator = SequenceAllocator::new(5);
        let values: Vec<u32> = (0..11).map(|_| allocator.next()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5, 1, 2, 3, 4, 5, 1]);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let allocator = Arc::new(SequenceAllocator::new(MAX_SEQUENCE));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || (0..1000).map(|_| allocator.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(all.insert(seq), "sequence {} allocated twice", seq);
            }
        }
        assert_eq!(all.len(), 4000);
        assert_eq!(*all.iter().max().unwrap(), 4000);
    }
}
