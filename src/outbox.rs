// SPDX-License-Identifier: LGPL-3.0-only

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// `Outbox` queues wire messages for transmission in FIFO order, releasing them no faster than
/// one per `interval`.
pub struct Outbox {
    queue: VecDeque<Vec<u8>>,
    interval: Duration,
    last: Option<Instant>,
}

impl Outbox {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            interval,
            last: None,
        }
    }

    pub fn push(&mut self, message: Vec<u8>) {
        self.queue.push_back(message);
    }

    /// `poll` releases the next message if the interval since the previous release has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.queue.is_empty() || self.next_deadline(now)? > now {
            return None;
        }
        self.last = Some(now);
        self.queue.pop_front()
    }

    /// `next_deadline` returns the earliest moment the next message can be released, or `None`
    /// if there is nothing to send.
    #[must_use]
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        if self.queue.is_empty() {
            return None;
        }
        Some(match self.last {
            Some(last) => std::cmp::max(last + self.interval, now),
            None => now,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::Outbox;

    #[test]
    fn test_fifo_without_interval() {
        let mut outbox = Outbox::new(Duration::ZERO);
        let now = Instant::now();
        assert_eq!(None, outbox.poll(now));
        outbox.push(b"first".to_vec());
        outbox.push(b"second".to_vec());
        assert_eq!(2, outbox.len());
        assert_eq!(Some(b"first".to_vec()), outbox.poll(now));
        assert_eq!(Some(b"second".to_vec()), outbox.poll(now));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_interval_is_respected() {
        let mut outbox = Outbox::new(Duration::from_millis(100));
        let start = Instant::now();
        outbox.push(b"first".to_vec());
        outbox.push(b"second".to_vec());
        assert_eq!(Some(start), outbox.next_deadline(start));
        assert_eq!(Some(b"first".to_vec()), outbox.poll(start));
        let early = start + Duration::from_millis(50);
        assert_eq!(None, outbox.poll(early));
        assert_eq!(
            Some(start + Duration::from_millis(100)),
            outbox.next_deadline(early)
        );
        let later = start + Duration::from_millis(100);
        assert_eq!(Some(b"second".to_vec()), outbox.poll(later));
        assert_eq!(None, outbox.next_deadline(later));
    }
}
