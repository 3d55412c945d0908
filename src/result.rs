/*
An ordered collection of (object, distance) pairs produced by a query.

Range queries use an unbounded set; nearest-neighbour queries bound it to k
pairs. While bounded, the set doubles as the dynamic search radius: the k-th
smallest distance seen so far is the cutoff below which new candidates are
still interesting.

Insertion is stable: a pair lands after every pair of equal distance, so with
tie handling off the first-seen of two equally distant objects wins.
*/

use crate::object::Object;

pub struct ResultSet<O: Object> {
    pairs: Vec<(O, f64)>,
    limit: Option<usize>,
    tie: bool,
}

impl<O: Object> ResultSet<O> {
    /// An unbounded result set, as used by range queries.
    pub fn new() -> Self {
        ResultSet {
            pairs: Vec::new(),
            limit: None,
            tie: false,
        }
    }

    /// A result set truncated to the k smallest distances. With `tie` set,
    /// pairs tied with the k-th distance survive the truncation.
    pub fn with_limit(k: usize, tie: bool) -> Self {
        ResultSet {
            pairs: Vec::new(),
            limit: Some(k),
            tie,
        }
    }

    /// Adds a pair, keeping the set sorted by distance and cut to its limit.
    pub fn add_pair(&mut self, object: O, distance: f64) {
        let at = self.pairs.partition_point(|pair| pair.1 <= distance);
        self.pairs.insert(at, (object, distance));
        self.cut();
    }

    fn cut(&mut self) {
        let k = match self.limit {
            Some(k) => k,
            None => return,
        };
        if self.tie {
            // drop the tail, but never a pair tied with the k-th distance
            while self.pairs.len() > k && self.pairs[self.pairs.len() - 1].1 > self.pairs[k - 1].1
            {
                self.pairs.pop();
            }
        } else {
            self.pairs.truncate(k);
        }
    }

    /// The current dynamic search radius: the k-th smallest distance, or
    /// infinity while the set still has room.
    pub fn maximum_distance(&self) -> f64 {
        match self.limit {
            Some(k) if self.pairs.len() >= k && k > 0 => self.pairs[k - 1].1,
            Some(0) => 0.0,
            _ => f64::INFINITY,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&(O, f64)> {
        self.pairs.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (O, f64)> {
        self.pairs.iter()
    }
}

impl<O: Object> Default for ResultSet<O> {
    fn default() -> Self {
        ResultSet::new()
    }
}

impl<O: Object> IntoIterator for ResultSet<O> {
    type Item = (O, f64);
    type IntoIter = std::vec::IntoIter<(O, f64)>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.into_iter()
    }
}
