//! Bounded event channels for fan-in

use tokio::sync::mpsc;

use crate::agent::InvocationContext;
use crate::error::{ConclaveError, Result};
use crate::event::Event;

/// Item carried between a producing branch and the merging consumer
pub type EventItem = Result<Option<Event>>;

/// Default capacity reserved per producing sub-agent
pub const DEFAULT_BUFFER_PER_PRODUCER: usize = 10;

/// Producer half. Cloned once per branch.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EventItem>,
}

impl EventSender {
    /// Deliver an item, waiting for capacity.
    ///
    /// Gives up as soon as `ctx` is cancelled; a cancelled context never
    /// delivers, even when capacity is available.
    pub async fn send(&self, item: EventItem, ctx: &InvocationContext) -> std::result::Result<(), ChannelError> {
        match ctx.guard(self.tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Cancelled),
        }
    }

    /// Check if the receiver is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Remaining free slots
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half
pub struct EventReceiver {
    rx: mpsc::Receiver<EventItem>,
}

impl EventReceiver {
    /// Next item; `None` once every sender is dropped and the buffer drained
    pub async fn recv(&mut self) -> Option<EventItem> {
        self.rx.recv().await
    }

    /// Try to receive an item (non-blocking)
    pub fn try_recv(&mut self) -> Option<EventItem> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting new items; buffered ones can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,
    #[error("Send cancelled")]
    Cancelled,
}

impl From<ChannelError> for ConclaveError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Cancelled => ConclaveError::Cancelled,
            ChannelError::Closed => ConclaveError::ChannelError(err.to_string()),
        }
    }
}

/// Builder for creating bounded event channels
pub struct ChannelBuilder {
    buffer_size: usize,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_PER_PRODUCER,
        }
    }

    /// Capacity sized for `producers` concurrent branches
    pub fn for_producers(producers: usize) -> Self {
        Self::new().buffer_size(producers.saturating_mul(DEFAULT_BUFFER_PER_PRODUCER))
    }

    /// Set buffer size; zero is bumped to one
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn build(self) -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        (EventSender { tx }, EventReceiver { rx })
    }
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
