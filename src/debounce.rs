use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_timer::Delay;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DebounceTicket(pub u64);

/// Trailing-edge debounce: a ticket settles only if no newer ticket was armed
/// (and the debouncer was not cancelled) while its delay elapsed.
#[derive(Clone)]
pub struct Debouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn arm(&self) -> DebounceTicket {
        DebounceTicket(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: DebounceTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.0
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn settle(&self, ticket: DebounceTicket) -> bool {
        if !self.delay.is_zero() {
            Delay::new(self.delay).await;
        }
        self.is_current(ticket)
    }

    pub async fn debounce<V>(&self, value: V) -> Option<V> {
        let ticket = self.arm();
        if self.settle(ticket).await {
            Some(value)
        } else {
            None
        }
    }
}
