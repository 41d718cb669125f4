//! Work queue of a connection
//!
//! Deferred closures are the only way to act on a connection from a thread that does not
//! own it. The worker running the connection drains the queue between I/O events.

use tokio::sync::mpsc;

use crate::{context::Context, thread_safe::SendError};

/// A unit of work run by the worker that owns the connection
pub(crate) type Work = Box<dyn FnOnce(&mut Context<'_>) + Send + 'static>;

/// A cloneable handle to the work queue of one connection
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Work>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl WorkQueue {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Work>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Adds a closure to run on the connection's worker.
    ///
    /// Closures added from the same thread run in the order they were added. Fails once the
    /// connection has terminated.
    pub fn add<F>(&self, f: F) -> Result<(), SendError>
    where
        F: FnOnce(&mut Context<'_>) + Send + 'static,
    {
        self.tx
            .send(Box::new(f))
            .map_err(|_| SendError::ConnectionClosed)
    }

    /// Whether the connection behind this queue has terminated
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::WorkQueue;
    use crate::thread_safe::SendError;

    #[test]
    fn test_add_fails_after_worker_is_gone() {
        let (queue, rx) = WorkQueue::new();
        assert!(queue.add(|_| {}).is_ok());
        drop(rx);
        assert!(queue.is_closed());
        assert!(matches!(queue.add(|_| {}), Err(SendError::ConnectionClosed)));
    }
}
