use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::vec::IntoIter;

use crate::common::{Id, NodeInfo};

#[derive(Debug, Clone)]
/// Bounded selection of the `k` nodes closest to a target.
///
/// Keeps a max-heap of at most `k` candidates keyed by XOR distance, so
/// feeding `n` nodes costs `O(n log k)`.
pub struct ClosestNodes {
    target: Id,
    k: usize,
    heap: BinaryHeap<Candidate>,
}

#[derive(Debug, Clone)]
struct Candidate {
    distance: Id,
    node: NodeInfo,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.node.id.cmp(&other.node.id))
    }
}

impl ClosestNodes {
    pub fn new(target: Id, k: usize) -> Self {
        Self {
            target,
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(256)),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    // === Public Methods ===

    /// Offer a node, keeping it only if it is among the `k` closest so far.
    ///
    /// Callers must not offer the same id twice.
    pub fn add(&mut self, node: NodeInfo) {
        if self.k == 0 {
            return;
        }

        let candidate = Candidate {
            distance: node.id.xor(&self.target),
            node,
        };

        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(mut furthest) = self.heap.peek_mut() {
            if candidate < *furthest {
                *furthest = candidate;
            }
        }
    }

    /// Consume the selection, returning nodes in ascending distance.
    pub fn into_sorted_vec(self) -> Vec<NodeInfo> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|candidate| candidate.node)
            .collect()
    }
}

impl IntoIterator for ClosestNodes {
    type Item = NodeInfo;
    type IntoIter = IntoIter<NodeInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_sorted_vec().into_iter()
    }
}
