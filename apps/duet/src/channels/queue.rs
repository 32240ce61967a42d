use std::collections::VecDeque;

/// Bounded FIFO that evicts its oldest entry when full.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Stored,
    /// The oldest entry was evicted to make room.
    EvictedOldest,
}

impl<T> OutboundQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, item: T) -> Enqueued {
        let outcome = if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.dropped += 1;
            Enqueued::EvictedOldest
        } else {
            Enqueued::Stored
        };
        self.items.push_back(item);
        outcome
    }

    /// Puts back an entry whose send failed so it goes out first next time.
    /// The entry is older than anything queued, so a full queue drops it.
    pub fn requeue_front(&mut self, item: T) -> Enqueued {
        if self.items.len() >= self.capacity {
            self.dropped += 1;
            return Enqueued::EvictedOldest;
        }
        self.items.push_front(item);
        Enqueued::Stored
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total entries ever evicted.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn keeps_fifo_order() {
        let mut queue = OutboundQueue::new(3);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test_timeout::timeout]
    fn full_queue_drops_oldest() {
        let mut queue = OutboundQueue::new(100);
        for value in 0..100 {
            assert_eq!(queue.push(value), Enqueued::Stored);
        }
        assert_eq!(queue.push(100), Enqueued::EvictedOldest);
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop(), Some(1));
    }

    #[test_timeout::timeout]
    fn requeued_item_goes_first() {
        let mut queue = OutboundQueue::new(2);
        queue.push("b");
        assert_eq!(queue.requeue_front("a"), Enqueued::Stored);
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
    }

    #[test_timeout::timeout]
    fn requeue_into_full_queue_keeps_newest() {
        let mut queue = OutboundQueue::new(2);
        queue.push("b");
        queue.push("c");
        assert_eq!(queue.requeue_front("a"), Enqueued::EvictedOldest);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("c"));
        assert_eq!(queue.pop(), None);
    }
}
