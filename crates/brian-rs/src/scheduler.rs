//! Pending synaptic effects, ordered by delivery step.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One synaptic effect waiting for its delivery step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEffect {
    pub due: u64,
    /// Scheduling order, breaks ties deterministically
    pub seq: u64,
    /// Index of the synapse set
    pub synapses: usize,
    /// Index of the synapse within its set
    pub synapse: usize,
}

impl Ord for PendingEffect {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want earliest first
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEffect {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of future deliveries. Every scheduled effect is popped exactly once.
#[derive(Debug, Default)]
pub struct DelayScheduler {
    heap: BinaryHeap<PendingEffect>,
    next_seq: u64,
    delivered: u64,
}

impl DelayScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: u64, synapses: usize, synapse: usize) {
        self.heap.push(PendingEffect { due, seq: self.next_seq, synapses, synapse });
        self.next_seq += 1;
    }

    /// Remove and return every effect due at or before `step`, in scheduling order
    pub fn pop_due(&mut self, step: u64) -> Vec<PendingEffect> {
        let mut due = Vec::new();
        while let Some(next) = self.heap.peek() {
            if next.due > step {
                break;
            }
            if let Some(effect) = self.heap.pop() {
                due.push(effect);
            }
        }
        self.delivered += due.len() as u64;
        due
    }

    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Earliest pending delivery step
    pub fn next_due(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.due)
    }
}
