//! The notifier: a typed event channel between the validation engine and
//! its downstream consumers (wallet, indexer, relay).
//!
//! Events are published from the engine strand, so subscribers observe them
//! in a fixed order: disconnected transactions first, then confirmed
//! blocks, then the tip update, then the mempool update.
//! Subscribers must not block; slow consumers lag and miss events rather
//! than stalling validation.

use std::sync::Arc;

use tokio::sync::broadcast;

use quagga_chain::{block, block::Block, transaction::Transaction};

/// An observable chain event.
#[derive(Clone, Debug)]
pub enum Event {
    /// A transaction left the active chain during a reorg.
    TxSyncedOutOfBlock(Arc<Transaction>),
    /// A new block's transactions were confirmed.
    AllTransactionsInBlock(Arc<Block>),
    /// The active-chain tip changed.
    BlockTipChanged {
        hash: block::Hash,
        height: u32,
        /// Whether the node is still far behind the header chain.
        is_initial_sync: bool,
    },
    /// The mempool contents changed following a tip update.
    MempoolUpdated,
    /// A freshly validated block should be announced to peers.
    RelayBlock(block::Hash),
}

/// Fan-out for [`Event`]s.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Event>,
}

impl Notifier {
    /// A notifier whose subscribers can lag by `capacity` events before
    /// missing any.
    pub fn new(capacity: usize) -> Notifier {
        let (sender, _) = broadcast::channel(capacity);
        Notifier { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Publishing with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        quagga_test::init();

        let notifier = Notifier::new(16);
        let mut rx = notifier.subscribe();

        notifier.publish(Event::MempoolUpdated);
        notifier.publish(Event::RelayBlock(block::Hash([1; 32])));

        assert!(matches!(rx.recv().await.unwrap(), Event::MempoolUpdated));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::RelayBlock(hash) if hash == block::Hash([1; 32])
        ));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        quagga_test::init();

        let notifier = Notifier::new(4);
        notifier.publish(Event::MempoolUpdated);
    }
}
