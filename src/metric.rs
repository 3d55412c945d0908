/*
A metric evaluator computes the distance between two objects. The tree only
ever sees it through the DistanceAdapter wrapper, which counts invocations so
callers can measure how many distance calculations a query cost.

The evaluator must satisfy the metric axioms (non-negativity, symmetry,
identity of indiscernibles, triangle inequality); the query pruning rules are
silently incorrect otherwise.
*/

use std::cell::Cell;
use std::marker::PhantomData;

use crate::object::Object;

/// A user-supplied metric distance function.
pub trait MetricEvaluator<O: Object> {
    fn distance(&self, a: &O, b: &O) -> f64;
}

/// Thin wrapper around a metric evaluator counting every invocation.
///
/// The counter is interior-mutable so a shared adapter (one instance serving
/// several trees) still accumulates a single total. Operations are never
/// interleaved, so a plain Cell is enough.
pub struct DistanceAdapter<O: Object, E: MetricEvaluator<O>> {
    evaluator: E,
    distance_count: Cell<u64>,
    _object: PhantomData<O>,
}

impl<O: Object, E: MetricEvaluator<O>> DistanceAdapter<O, E> {
    pub fn new(evaluator: E) -> Self {
        DistanceAdapter {
            evaluator,
            distance_count: Cell::new(0),
            _object: PhantomData,
        }
    }

    pub fn distance(&self, a: &O, b: &O) -> f64 {
        self.distance_count.set(self.distance_count.get() + 1);
        self.evaluator.distance(a, b)
    }

    /// Number of distance evaluations since the last reset.
    pub fn distance_count(&self) -> u64 {
        self.distance_count.get()
    }

    pub fn reset_statistics(&self) {
        self.distance_count.set(0);
    }
}
