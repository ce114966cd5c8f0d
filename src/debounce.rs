use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_timer::Delay;

/// Trailing-edge debouncer: every `arm` supersedes all earlier tickets, so of
/// any burst of triggers only the last one survives its quiet period.
#[derive(Clone)]
pub struct Debouncer {
    delay: Duration,
    seq: Arc<AtomicU64>,
}

/// Cancellable handle for one armed trigger.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DebounceTicket(pub u64);

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Claims the debounce window, superseding any pending ticket.
    pub fn arm(&self) -> DebounceTicket {
        DebounceTicket(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Invalidates every outstanding ticket without arming a new one.
    pub fn cancel(&self) {
        self.seq.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_current(&self, ticket: DebounceTicket) -> bool {
        self.seq.load(Ordering::SeqCst) == ticket.0
    }

    /// Sleeps out the window and reports whether `ticket` survived it. A false
    /// return means a later trigger or a cancel took over; the caller must not
    /// act on this ticket.
    pub async fn wait(&self, ticket: DebounceTicket) -> bool {
        if !self.delay.is_zero() {
            Delay::new(self.delay).await;
        }
        self.is_current(ticket)
    }
}
