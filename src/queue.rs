/*
Priority queue of subtrees still to be visited by a nearest-neighbour
search, ordered by the lower bound d_min on the distance between the query
object and anything reachable under the subtree. Ties pop in page id order so
equal inputs always traverse the same way.
*/

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A subtree waiting in the queue.
#[derive(Debug, Clone, Copy)]
pub struct PendingSubtree {
    /// Lower bound on d(q, x) for every object x under this subtree.
    pub d_min: f64,
    pub page_id: u32,
    /// Distance from the query to this node's representative, already paid
    /// for by the parent expansion. None only for the root.
    pub d_rep: Option<f64>,
}

impl PartialEq for PendingSubtree {
    fn eq(&self, other: &Self) -> bool {
        self.d_min == other.d_min && self.page_id == other.page_id
    }
}

impl Eq for PendingSubtree {}

impl Ord for PendingSubtree {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we pop the smallest bound
        other
            .d_min
            .total_cmp(&self.d_min)
            .then_with(|| other.page_id.cmp(&self.page_id))
    }
}

impl PartialOrd for PendingSubtree {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct SubtreeQueue {
    heap: BinaryHeap<PendingSubtree>,
}

impl SubtreeQueue {
    pub fn new() -> Self {
        SubtreeQueue {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, item: PendingSubtree) {
        self.heap.push(item);
    }

    /// Removes and returns the subtree with the smallest lower bound.
    pub fn pop(&mut self) -> Option<PendingSubtree> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for SubtreeQueue {
    fn default() -> Self {
        SubtreeQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(d_min: f64, page_id: u32) -> PendingSubtree {
        PendingSubtree {
            d_min,
            page_id,
            d_rep: None,
        }
    }

    #[test]
    fn test_pops_smallest_bound_first() {
        let mut queue = SubtreeQueue::new();
        queue.push(item(3.0, 2));
        queue.push(item(1.0, 3));
        queue.push(item(2.0, 4));

        assert_eq!(queue.pop().unwrap().page_id, 3);
        assert_eq!(queue.pop().unwrap().page_id, 4);
        assert_eq!(queue.pop().unwrap().page_id, 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_ties_pop_in_page_order() {
        let mut queue = SubtreeQueue::new();
        queue.push(item(1.0, 9));
        queue.push(item(1.0, 2));
        queue.push(item(1.0, 5));

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop().map(|i| i.page_id)).collect();
        assert_eq!(order, vec![2, 5, 9]);
    }
}
