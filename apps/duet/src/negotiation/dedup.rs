use std::collections::{HashSet, VecDeque};

/// Rolling window of recently seen signaling message ids.
#[derive(Debug)]
pub struct SeenMessages {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records `id`; returns false if it was already in the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn duplicates_are_rejected() {
        let mut seen = SeenMessages::new(4);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert_eq!(seen.len(), 1);
    }

    #[test_timeout::timeout]
    fn window_forgets_oldest() {
        let mut seen = SeenMessages::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert_eq!(seen.len(), 2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }
}
