//! Weighted random permutation.
//!
//! Repeatedly drawing an element with probability proportional to its
//! remaining weight yields a permutation that favors heavy items for
//! the front without ever starving light ones. The brokers use this as
//! the "rotation" for allocation decisions.

/// A collection of weighted items, consumed by [`WeightedSet::permute`].
pub struct WeightedSet<T> {
    members: Vec<(T, f64)>,
    sum: f64,
}

impl<T> WeightedSet<T> {
    pub fn new() -> Self {
        WeightedSet {
            members: Vec::new(),
            sum: 0.0,
        }
    }

    /// Add an item. Items with non-positive weight are excluded — they
    /// can never be drawn.
    pub fn add(&mut self, item: T, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        self.members.push((item, weight));
        self.sum += weight;
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Produce a weighted random permutation, consuming the set.
    ///
    /// `random` supplies draws in `[0, 1)`; it's injected so allocation
    /// behavior can be pinned down in tests. Heavier items are sorted
    /// first so that a rigged `random` of all zeros yields a
    /// deterministic heaviest-first order.
    pub fn permute(mut self, random: &mut dyn FnMut() -> f64) -> Vec<T> {
        // Sort by decreasing weight (stable, so insertion order breaks
        // ties).
        self.members
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut unchosen = self.members;
        let mut chosen = Vec::with_capacity(unchosen.len());
        let mut sum = self.sum;

        // O(n^2), but n is the number of competing effects.
        while !unchosen.is_empty() {
            let pick = random() * sum;
            let mut running = 0.0;
            let mut choice = unchosen.len() - 1; // float drift fallback
            for idx in 0..unchosen.len() {
                running += unchosen[idx].1;
                if running >= pick {
                    choice = idx;
                    break;
                }
            }
            let (item, weight) = unchosen.remove(choice);
            sum -= weight;
            chosen.push(item);
        }

        chosen
    }
}

impl<T> Default for WeightedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
