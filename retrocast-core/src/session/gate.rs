use std::sync::Arc;

use tokio::sync::watch;

use crate::error::StreamError;

/// Outcome carried by a closed gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateSignal {
    Ready,
    Failed(StreamError),
    /// A seek replaced the attempt this gate belonged to.
    Superseded,
    Closed,
}

/// One-shot readiness signal for a single encode attempt.
///
/// The first `close` wins; later calls are ignored. A new attempt gets a new
/// gate, so a waiter holding an old one can never observe the new attempt.
#[derive(Debug, Clone)]
pub struct ReadyGate {
    tx: Arc<watch::Sender<Option<GateSignal>>>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true if this call closed the gate.
    pub fn close(&self, signal: GateSignal) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        })
    }

    pub fn signal(&self) -> Option<GateSignal> {
        self.tx.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn same_as(&self, other: &ReadyGate) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    pub async fn wait(&self) -> GateSignal {
        let mut rx = self.tx.subscribe();
        let signal = match rx.wait_for(Option::is_some).await {
            Ok(signal) => signal.clone(),
            Err(_) => None,
        };
        signal.unwrap_or(GateSignal::Closed)
    }
}
