use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::time::Instant;

struct Scheduled<T> {
    at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    // Reversed: BinaryHeap is a max-heap and we pop the earliest deadline.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of deadlines, FIFO among equal instants.
pub struct DeadlineQueue<T> {
    heap: BinaryHeap<Scheduled<T>>,
    next_seq: u64,
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for DeadlineQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineQueue")
            .field("len", &self.heap.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

impl<T> DeadlineQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, at: Instant, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled { at, seq, item });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|s| s.at)
    }

    /// Remove and return every item due at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<T> {
        let mut out = Vec::new();
        while self.heap.peek().is_some_and(|s| s.at <= now) {
            if let Some(s) = self.heap.pop() {
                out.push(s.item);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order_fifo_on_ties() {
        let base = Instant::now();
        let mut q = DeadlineQueue::new();
        q.schedule(base + Duration::from_millis(30), "c");
        q.schedule(base + Duration::from_millis(10), "a1");
        q.schedule(base + Duration::from_millis(10), "a2");
        q.schedule(base + Duration::from_millis(20), "b");

        assert_eq!(q.next_deadline(), Some(base + Duration::from_millis(10)));
        assert_eq!(q.pop_expired(base), Vec::<&str>::new());
        assert_eq!(
            q.pop_expired(base + Duration::from_millis(20)),
            vec!["a1", "a2", "b"]
        );
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_expired(base + Duration::from_secs(1)), vec!["c"]);
        assert!(q.is_empty());
        assert_eq!(q.next_deadline(), None);
    }
}
