//! Run-wide cancellation signal over a `watch` channel.

use std::sync::Arc;

use tokio::sync::watch;

use membreak_state::FailureKind;

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    RunTimeout,
}

impl CancelReason {
    /// Message recorded on every agent run the cancellation cut short.
    pub fn message(&self) -> &'static str {
        match self {
            CancelReason::Requested => "cancelled",
            CancelReason::RunTimeout => "run timeout exceeded",
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CancelReason::Requested => FailureKind::Cancelled,
            CancelReason::RunTimeout => FailureKind::Timeout,
        }
    }
}

/// Owning side; cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Only the first reason sticks; returns whether
    /// this call was the one that cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn subscribe(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Listening side held by each agent task.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelSignal {
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled. Pending forever if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) -> CancelReason {
        // Copy out of the borrow guard before any further await.
        let seen = self.rx.wait_for(|r| r.is_some()).await.map(|r| *r);
        match seen {
            Ok(reason) => reason.unwrap_or(CancelReason::Requested),
            Err(_) => std::future::pending().await,
        }
    }
}
