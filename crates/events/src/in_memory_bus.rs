use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusPoisoned;

/// Process-local bus over std channels.
///
/// Subscriptions that were dropped are forgotten on the next publish.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    senders: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone + Send + 'static> EventBus<M> for InMemoryEventBus<M> {
    type Error = BusPoisoned;

    fn publish(&self, message: M) -> Result<(), BusPoisoned> {
        let mut senders = self.senders.lock().map_err(|_| BusPoisoned)?;
        senders.retain(|sender| sender.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (sender, receiver) = mpsc::channel();
        match self.senders.lock() {
            Ok(mut senders) => senders.push(sender),
            Err(poisoned) => poisoned.into_inner().push(sender),
        }
        Subscription::new(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_subscription_gets_its_own_copy() {
        let bus = InMemoryEventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.publish("submitted").unwrap();
        bus.publish("priced").unwrap();

        assert_eq!(first.drain(), vec!["submitted", "priced"]);
        assert_eq!(second.drain(), vec!["submitted", "priced"]);
        assert!(first.drain().is_empty());
    }

    #[test]
    fn late_subscribers_miss_earlier_messages() {
        let bus = InMemoryEventBus::new();
        bus.publish(1u64).unwrap();
        let late = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(2u64).unwrap();
        assert_eq!(late.drain(), vec![2]);
    }
}
