//! Fan-out of committed events to observers.
//!
//! The store is authoritative and the bus only repeats what it already holds, so
//! observers may see an envelope more than once and must key on
//! `(aggregate_id, sequence_number)`.

use std::sync::Arc;
use std::sync::mpsc::Receiver;

/// One observer's queue of published messages.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Everything published since the last drain, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Broadcast channel: every subscription gets its own copy of every message.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B: EventBus<M> + ?Sized> EventBus<M> for Arc<B> {
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        B::publish(self, message)
    }

    fn subscribe(&self) -> Subscription<M> {
        B::subscribe(self)
    }
}
