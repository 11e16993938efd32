//! Two-level interruption: a soft stop and a hard cancel.
//!
//! A stop lets the current engine call finish, skips every remaining run and
//! still cleans up. A cancel abandons the in-flight call, skips cleanup and
//! leaves remaining runs pending. The two tokens are independent roots: the
//! caller's own cancellation never reaches them, only [`Interrupts::stop`],
//! [`Interrupts::cancel`] and [`Interrupts::escalate`] do.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a new interrupt signal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// First signal: soft stop requested.
    Stopped,
    /// Second signal: hard cancel requested.
    Cancelled,
    /// Already cancelled; nothing changed.
    AlreadyCancelled,
}

#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a soft stop. Idempotent.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            debug!("soft stop requested");
        }
        self.stop.cancel();
    }

    /// Request a hard cancel. Idempotent and irreversible.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            warn!("hard cancel requested");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }

    /// Resolves once a cancel has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Apply one user interrupt: the first stops, the second cancels, later
    /// ones are absorbed.
    pub fn escalate(&self) -> Escalation {
        if self.is_cancelled() {
            Escalation::AlreadyCancelled
        } else if self.is_stopped() {
            self.cancel();
            Escalation::Cancelled
        } else {
            self.stop();
            Escalation::Stopped
        }
    }
}

/// Wait for `fut`, giving up after `grace`. `None` means the grace period ran out.
pub async fn wait_with_grace<F: Future>(fut: F, grace: Duration) -> Option<F::Output> {
    tokio::time::timeout(grace, fut).await.ok()
}
