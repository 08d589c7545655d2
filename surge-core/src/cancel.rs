use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative cancellation, observed by workers at iteration boundaries.
///
/// One signal per run: whichever of the external interrupt handler, the
/// duration timer or the taint-abort fires first wins; later calls are
/// no-ops.
#[derive(Debug, Default)]
pub struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once the signal fires; returns immediately if it already has.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let mut notified = pin!(self.notify.notified());
            // Register before the re-check so a concurrent cancel() cannot
            // slip between the check and the await.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wakes_waiters_and_stays_latched() {
        let signal = Arc::new(CancelSignal::new());
        assert!(!signal.is_cancelled());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
            })
        };

        signal.cancel();
        waiter.await.expect("waiter exits");

        assert!(signal.is_cancelled());
        // Already-cancelled signals resolve immediately.
        signal.cancelled().await;
    }
}
