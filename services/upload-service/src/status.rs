//! Liveness of the two broker connections.
//!
//! Each flag has exactly one writer (the owning loop) and any number of
//! readers (the status endpoint). The flags are independent; readers never
//! need a consistent snapshot of both.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct ConnectionStatus {
    producer_connected: AtomicBool,
    consumer_connected: AtomicBool,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer_connected(&self) -> bool {
        self.producer_connected.load(Ordering::Acquire)
    }

    pub fn consumer_connected(&self) -> bool {
        self.consumer_connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_producer_connected(&self, connected: bool) {
        self.producer_connected.store(connected, Ordering::Release);
    }

    pub(crate) fn set_consumer_connected(&self, connected: bool) {
        self.consumer_connected.store(connected, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected() {
        let status = ConnectionStatus::new();
        assert!(!status.producer_connected());
        assert!(!status.consumer_connected());
    }

    #[test]
    fn test_flags_are_independent() {
        let status = ConnectionStatus::new();

        status.set_producer_connected(true);
        assert!(status.producer_connected());
        assert!(!status.consumer_connected());

        status.set_consumer_connected(true);
        status.set_producer_connected(false);
        assert!(!status.producer_connected());
        assert!(status.consumer_connected());
    }
}
