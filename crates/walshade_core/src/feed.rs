//! Change feed for observing shadow WAL progress.
//!
//! The capture engine emits the post-tick replication position whenever a
//! tick changed the shadow state: new frames were copied, the live WAL
//! restarted, or a new generation was started. Replicas subscribe and wake
//! on each event to stream from their last position.
//!
//! Notifications are at-least-once per observable change; the payload is
//! the position after the change, so a slow subscriber that misses
//! intermediate events still learns the latest cursor.

use crate::pos::Pos;
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// Distributes shadow WAL change notifications to subscribers.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    /// Subscribers (senders). Disconnected receivers are pruned on emit.
    subscribers: RwLock<Vec<Sender<Pos>>>,
}

impl ChangeFeed {
    /// Creates a new change feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to shadow WAL changes.
    ///
    /// Returns a receiver that yields the replication position after every
    /// change observed from the point of subscription onward.
    pub fn subscribe(&self) -> Receiver<Pos> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a change to all subscribers, pruning disconnected ones.
    pub fn emit(&self, pos: Pos) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(pos.clone()).is_ok());
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn emit_and_receive() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();

        let pos = Pos::new("0011223344556677", 0, 4152);
        feed.emit(pos.clone());

        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received, pos);
    }

    #[test]
    fn multiple_subscribers() {
        let feed = ChangeFeed::new();
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();

        let pos = Pos::new("0011223344556677", 1, 32);
        feed.emit(pos.clone());

        assert_eq!(rx1.recv().unwrap(), pos);
        assert_eq!(rx2.recv().unwrap(), pos);
    }

    #[test]
    fn disconnected_subscribers_pruned() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(Pos::default());
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn every_change_is_delivered_in_order() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();

        for offset in [32u64, 4152, 8272] {
            feed.emit(Pos::new("0011223344556677", 0, offset));
        }

        assert_eq!(rx.recv().unwrap().offset, 32);
        assert_eq!(rx.recv().unwrap().offset, 4152);
        assert_eq!(rx.recv().unwrap().offset, 8272);
    }
}
