//! Bounded queue of document updates that could not be published.
//!
//! Queued updates are retried in order before any newer update goes out.
//! Losing one is survivable (the next bootstrap exchange carries the full
//! state), so a full queue drops rather than blocks.

use std::collections::VecDeque;

/// FIFO of pending DOC_UPDATE payloads.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns false (and drops it) when full.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    /// Publish queued updates oldest first, stopping at the first failure.
    ///
    /// Returns how many were sent.
    pub fn retry<E>(&mut self, mut publish: impl FnMut(&[u8]) -> Result<(), E>) -> Result<usize, E> {
        let mut sent = 0;
        while let Some(front) = self.queue.front() {
            publish(front.as_slice())?;
            self.queue.pop_front();
            sent += 1;
        }
        Ok(sent)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_until_full() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(vec![1]));
        assert!(queue.enqueue(vec![2, 3]));
        assert!(!queue.enqueue(vec![4]));
        assert_eq!(queue.len(), 2);

        // Room again once the backlog drains
        queue.retry(|_| Ok::<(), ()>(())).unwrap();
        assert!(queue.enqueue(vec![4]));
    }

    #[test]
    fn test_retry_in_order() {
        let mut queue = OfflineQueue::new(10);
        for i in 0..3u8 {
            queue.enqueue(vec![i]);
        }

        let mut seen = Vec::new();
        let sent = queue
            .retry(|p| {
                seen.push(p[0]);
                Ok::<(), ()>(())
            })
            .unwrap();
        assert_eq!(sent, 3);
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_retry_stops_at_failure() {
        let mut queue = OfflineQueue::new(10);
        for i in 0..4u8 {
            queue.enqueue(vec![i]);
        }

        let mut budget = 2;
        let result = queue.retry(|_| {
            if budget == 0 {
                return Err("link down");
            }
            budget -= 1;
            Ok(())
        });
        assert_eq!(result, Err("link down"));
        // The failed update stays at the front
        assert_eq!(queue.len(), 2);
        let mut rest = Vec::new();
        queue
            .retry(|p| {
                rest.push(p[0]);
                Ok::<(), ()>(())
            })
            .unwrap();
        assert_eq!(rest, vec![2, 3]);
    }
}
