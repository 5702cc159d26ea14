//! The message bus contract the grid consumes, and an in-process reference implementation.
//!
//! The real contract is deliberately thin: `publish` is best-effort, unordered, and may drop
//! messages; `subscribe` delivers every message observed to one local handler. A TCP- or
//! UDP-backed adapter would satisfy the same trait; [`InProcessBus`] is the reference used by
//! tests and by single-process grids, backed by an `mpb::MPB` broadcast queue.

use crossbeam_channel::Receiver;
use mpb::MPB;

use crate::message::Message;

/// Process-wide, created before any storage and closed only after every storage using it has
/// closed.
pub trait MessageBus: Send + Sync {
    /// Publishes `message` to every current subscriber. Best-effort: may be lost, reordered,
    /// or duplicated by a real transport.
    fn publish(&self, message: Message);

    /// Registers a new subscriber, returning a channel that receives every message observed
    /// on the bus from this point on.
    fn subscribe(&self) -> Receiver<Message>;
}

/// An in-process, shared-memory message bus. Every [`Grid`](crate::grid::Grid) sharing one
/// `InProcessBus` behaves as if connected by a perfectly reliable, in-order transport; tests
/// that want to exercise loss or reordering filter messages at the subscriber instead.
pub struct InProcessBus {
    inner: MPB<Message>,
}

impl InProcessBus {
    pub fn new() -> Self {
        InProcessBus { inner: MPB::new() }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for InProcessBus {
    fn publish(&self, message: Message) {
        let _ = self.inner.sender().send(message);
    }

    fn subscribe(&self) -> Receiver<Message> {
        self.inner.receiver()
    }
}
