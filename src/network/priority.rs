//! Dispatch ordering for runnable requests
//!
//! Higher priority runs first; equal priorities run in submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Default concurrent transport slots
pub const DEFAULT_MAX_CONCURRENT: usize = 6;

/// A runnable request waiting for a transport slot
#[derive(Debug, Clone, Copy)]
pub struct DispatchCandidate {
    /// Submission sequence number, unique per queue
    pub sequence: u64,
    pub priority: f32,
}

impl DispatchCandidate {
    pub fn new(sequence: u64, priority: f32) -> Self {
        Self { sequence, priority }
    }
}

impl PartialEq for DispatchCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DispatchCandidate {}

impl PartialOrd for DispatchCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DispatchCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Greater = dispatched sooner
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority heap of runnable requests
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<DispatchCandidate>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: DispatchCandidate) {
        self.heap.push(candidate);
    }

    pub fn pop(&mut self) -> Option<DispatchCandidate> {
        self.heap.pop()
    }

    /// Take up to `available` sequence numbers in dispatch order
    pub fn next_batch(&mut self, available: usize) -> Vec<u64> {
        let mut batch = Vec::with_capacity(available.min(self.heap.len()));
        while batch.len() < available {
            match self.heap.pop() {
                Some(candidate) => batch.push(candidate.sequence),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Extend<DispatchCandidate> for ReadyQueue {
    fn extend<I: IntoIterator<Item = DispatchCandidate>>(&mut self, iter: I) {
        self.heap.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_priority_first() {
        let mut queue = ReadyQueue::new();
        queue.push(DispatchCandidate::new(1, 0.1));
        queue.push(DispatchCandidate::new(2, 0.9));
        queue.push(DispatchCandidate::new(3, 0.5));

        assert_eq!(queue.next_batch(3), vec![2, 3, 1]);
    }

    #[test]
    fn test_ties_break_by_submission_order() {
        let mut queue = ReadyQueue::new();
        queue.extend([
            DispatchCandidate::new(7, 0.5),
            DispatchCandidate::new(3, 0.5),
            DispatchCandidate::new(5, 0.5),
        ]);
        assert_eq!(queue.next_batch(2), vec![3, 5]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_batch_limited_by_slots() {
        let mut queue = ReadyQueue::new();
        assert!(queue.next_batch(4).is_empty());
        queue.push(DispatchCandidate::new(1, 0.5));
        assert!(queue.next_batch(0).is_empty());
        assert_eq!(queue.pop().map(|c| c.sequence), Some(1));
        assert!(queue.is_empty());
    }
}
