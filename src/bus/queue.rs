//! Bounded Priority Queue
//!
//! Vec-based queue kept in priority order (high to low) with FIFO order
//! among equal priorities. When full, the oldest entry of equal or lower
//! priority makes room for a new one.

#[derive(Debug)]
pub struct BoundedPriorityQueue<T> {
    items: Vec<(i32, u64, T)>, // (priority, sequence, item)
    capacity: usize,
    next_seq: u64,
}

/// Outcome of a push into a full queue
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Accepted,
    /// Accepted after evicting this entry
    Evicted(T),
    /// Nothing of equal or lower priority could be evicted
    Rejected(T),
}

impl<T> BoundedPriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, priority: i32, item: T) -> PushOutcome<T> {
        let mut evicted = None;
        if self.items.len() >= self.capacity {
            let victim = self
                .items
                .iter()
                .enumerate()
                .filter(|(_, (p, _, _))| *p <= priority)
                .min_by_key(|(_, (_, seq, _))| *seq)
                .map(|(index, _)| index);
            match victim {
                Some(index) => evicted = Some(self.items.remove(index).2),
                None => return PushOutcome::Rejected(item),
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        // Find insertion point to maintain order (high to low priority, FIFO within)
        let pos = self
            .items
            .binary_search_by(|(p, s, _)| priority.cmp(p).then(s.cmp(&seq)))
            .unwrap_or_else(|e| e);
        self.items.insert(pos, (priority, seq, item));

        match evicted {
            Some(old) => PushOutcome::Evicted(old),
            None => PushOutcome::Accepted,
        }
    }

    pub fn pop(&mut self) -> Option<(i32, T)> {
        if self.items.is_empty() {
            None
        } else {
            let (priority, _, item) = self.items.remove(0);
            Some((priority, item))
        }
    }

    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
