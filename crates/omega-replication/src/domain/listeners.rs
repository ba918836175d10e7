//! Fan-out of one result to every caller waiting on the same want.

use tokio::sync::oneshot;

use crate::domain::errors::ReplicationError;

/// Receiving end handed to a waiting caller.
pub type Waiter<T> = oneshot::Receiver<Result<T, ReplicationError>>;

/// Callers waiting on one want.
///
/// Completing the queue consumes every handle, so each caller sees exactly
/// one outcome.
#[derive(Debug)]
pub struct Listeners<T> {
    senders: Vec<oneshot::Sender<Result<T, ReplicationError>>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
        }
    }
}

impl<T: Clone> Listeners<T> {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a caller.
    pub fn attach(&mut self) -> Waiter<T> {
        let (tx, rx) = oneshot::channel();
        self.senders.push(tx);
        rx
    }

    /// Move every caller of `other` into this queue.
    pub fn append(&mut self, other: &mut Listeners<T>) {
        self.senders.append(&mut other.senders);
    }

    /// Drop callers that stopped waiting.
    pub fn prune(&mut self) {
        self.senders.retain(|tx| !tx.is_closed());
    }

    /// Whether no caller is waiting.
    pub fn is_empty(&self) -> bool {
        self.senders.iter().all(|tx| tx.is_closed())
    }

    /// Number of attached callers.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Complete every caller with `value`.
    pub fn resolve(&mut self, value: T) {
        for tx in self.senders.drain(..) {
            let _ = tx.send(Ok(value.clone()));
        }
    }

    /// Complete every caller with `err`.
    pub fn reject(&mut self, err: ReplicationError) {
        for tx in self.senders.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// A waiter that is already complete.
pub fn ready<T: Clone>(result: Result<T, ReplicationError>) -> Waiter<T> {
    let mut listeners = Listeners::new();
    let waiter = listeners.attach();
    match result {
        Ok(value) => listeners.resolve(value),
        Err(err) => listeners.reject(err),
    }
    waiter
}
