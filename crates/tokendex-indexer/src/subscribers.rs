//! Subscription registry.
//!
//! Maps script fingerprints to broadcast channels. The synchronizer pushes
//! one message per touched script per state change, in commit order; each
//! receiver observes its script's messages in that order. Delivery is
//! best-effort: the channels are bounded, a lagging receiver loses old
//! messages instead of blocking ingestion, and closed channels are pruned on
//! the next send.

use std::collections::HashMap;

use bitcoin::Txid;
use parking_lot::RwLock;
use tokendex_primitives::ScriptPayload;
use tokio::sync::broadcast;

/// Per-script channel capacity. Subscribers that fall further behind than
/// this lose the oldest messages.
const CHANNEL_CAPACITY: usize = 64;

/// A state change pushed to subscribers of a touched script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeMessage {
    AddedToMempool(Txid),
    RemovedFromMempool(Txid),
    Confirmed(Txid),
    /// The transaction was part of a disconnected block and did not make it
    /// back into the mempool.
    Reorg(Txid),
}

impl SubscribeMessage {
    pub fn txid(&self) -> Txid {
        match self {
            SubscribeMessage::AddedToMempool(txid)
            | SubscribeMessage::RemovedFromMempool(txid)
            | SubscribeMessage::Confirmed(txid)
            | SubscribeMessage::Reorg(txid) => *txid,
        }
    }
}

/// A client frame toggling interest in one script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub script: ScriptPayload,
    pub is_subscribe: bool,
}

/// Script fingerprint -> live broadcast channel.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subs: RwLock<HashMap<ScriptPayload, broadcast::Sender<SubscribeMessage>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a script. Repeated subscriptions share one channel.
    pub fn subscribe(&self, script: &ScriptPayload) -> broadcast::Receiver<SubscribeMessage> {
        let mut subs = self.subs.write();
        match subs.get(script) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
                subs.insert(script.clone(), sender);
                receiver
            }
        }
    }

    /// Drop the script's channel once no receiver is left. Unsubscribing an
    /// unknown script is a no-op.
    pub fn unsubscribe(&self, script: &ScriptPayload) {
        let mut subs = self.subs.write();
        if let Some(sender) = subs.get(script) {
            if sender.receiver_count() == 0 {
                subs.remove(script);
            }
        }
    }

    /// Apply a client subscription frame. Returns a receiver for subscribe
    /// frames, `None` for unsubscribe frames.
    pub fn handle(&self, subscription: &Subscription) -> Option<broadcast::Receiver<SubscribeMessage>> {
        if subscription.is_subscribe {
            Some(self.subscribe(&subscription.script))
        } else {
            self.unsubscribe(&subscription.script);
            None
        }
    }

    /// Number of scripts with a live channel.
    pub fn num_scripts(&self) -> usize {
        self.subs.read().len()
    }

    /// Deliver `msg` to every channel subscribed to any of `scripts`.
    ///
    /// `scripts` is already deduplicated per event, so each channel sees the
    /// message exactly once. Never blocks; channels whose last receiver went
    /// away are removed.
    pub(crate) fn notify(&self, scripts: &[ScriptPayload], msg: &SubscribeMessage) {
        let mut subs = self.subs.write();
        for script in scripts {
            if let Some(sender) = subs.get(script) {
                if sender.send(msg.clone()).is_err() {
                    // Unclean unsubscribe: all receivers dropped.
                    subs.remove(script);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use tokendex_primitives::PayloadPrefix;

    fn script(byte: u8) -> ScriptPayload {
        ScriptPayload::new(PayloadPrefix::P2pkh, vec![byte; 20])
    }

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    #[test]
    fn test_subscribe_and_notify() {
        let registry = SubscriptionRegistry::new();
        let mut receiver = registry.subscribe(&script(1));
        registry.notify(&[script(1)], &SubscribeMessage::Confirmed(txid(7)));
        assert_eq!(
            receiver.try_recv().unwrap(),
            SubscribeMessage::Confirmed(txid(7))
        );
    }

    #[test]
    fn test_untouched_scripts_receive_nothing() {
        let registry = SubscriptionRegistry::new();
        let mut receiver = registry.subscribe(&script(1));
        registry.notify(&[script(2)], &SubscribeMessage::Confirmed(txid(7)));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_messages_arrive_in_commit_order() {
        let registry = SubscriptionRegistry::new();
        let mut receiver = registry.subscribe(&script(1));
        registry.notify(&[script(1)], &SubscribeMessage::AddedToMempool(txid(1)));
        registry.notify(&[script(1)], &SubscribeMessage::Confirmed(txid(1)));
        assert_eq!(
            receiver.try_recv().unwrap(),
            SubscribeMessage::AddedToMempool(txid(1))
        );
        assert_eq!(
            receiver.try_recv().unwrap(),
            SubscribeMessage::Confirmed(txid(1))
        );
    }

    #[test]
    fn test_closed_channels_are_pruned() {
        let registry = SubscriptionRegistry::new();
        let receiver = registry.subscribe(&script(1));
        assert_eq!(registry.num_scripts(), 1);
        drop(receiver);
        registry.notify(&[script(1)], &SubscribeMessage::Confirmed(txid(7)));
        assert_eq!(registry.num_scripts(), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        // Unknown script: no-op.
        registry.unsubscribe(&script(9));
        let receiver = registry.subscribe(&script(1));
        // Still has a receiver: channel stays.
        registry.unsubscribe(&script(1));
        assert_eq!(registry.num_scripts(), 1);
        drop(receiver);
        registry.unsubscribe(&script(1));
        assert_eq!(registry.num_scripts(), 0);
        registry.unsubscribe(&script(1));
    }

    #[test]
    fn test_handle_subscription_frames() {
        let registry = SubscriptionRegistry::new();
        let receiver = registry.handle(&Subscription {
            script: script(1),
            is_subscribe: true,
        });
        assert!(receiver.is_some());
        drop(receiver);
        let none = registry.handle(&Subscription {
            script: script(1),
            is_subscribe: false,
        });
        assert!(none.is_none());
        assert_eq!(registry.num_scripts(), 0);
    }
}
