//! Bounded hand-off queue that favours freshness over completeness.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// Bounded queue with drop-oldest backpressure.
///
/// `push` never blocks: when the queue is full the oldest queued item is
/// evicted to make room for the new one. Consumers pull with a bounded wait.
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> Clone for DropOldestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Insert `item`, returning how many queued items were evicted for it.
    pub fn push(&self, item: T) -> usize {
        let mut item = item;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                    }
                    item = back;
                }
                // Unreachable while `self` holds a receiver.
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Wait up to `timeout` for the oldest queued item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_keeps_most_recent_items() {
        let queue = DropOldestQueue::new(2);
        let mut evicted = 0;
        for value in 0..10 {
            evicted += queue.push(value);
            assert!(queue.len() <= queue.capacity());
        }
        assert_eq!(evicted, 8);
        assert_eq!(queue.try_pop(), Some(8));
        assert_eq!(queue.try_pop(), Some(9));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn capacity_one_always_holds_latest() {
        let queue = DropOldestQueue::new(1);
        for value in 0..5 {
            queue.push(value);
            assert_eq!(queue.len(), 1);
        }
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), Some(4));
    }

    #[test]
    fn zero_capacity_is_promoted_to_one() {
        let queue = DropOldestQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.push("a"), 0);
        assert_eq!(queue.push("b"), 1);
        assert_eq!(queue.try_pop(), Some("b"));
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue: DropOldestQueue<u8> = DropOldestQueue::new(2);
        let started = std::time::Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn producer_on_other_thread_never_blocks() {
        let queue = DropOldestQueue::new(2);
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            for value in 0..1_000u32 {
                producer.push(value);
            }
        });
        handle.join().unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(998));
        assert_eq!(queue.try_pop(), Some(999));
    }
}
