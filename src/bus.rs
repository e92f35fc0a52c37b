//! Bounded message channels shared between the connectivity core and the rest of the device.
//!
//! Every item is a UTF-8 JSON fragment `{"TTTT": <payload>}`. Producers wait briefly when a
//! channel is full and then drop the item; losing a message here is tolerated.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

/// How long a producer waits for room before dropping
pub const OFFER_WAIT: Duration = Duration::from_millis(100);

/// Capacity of the inbound-publish channel between the transaction engine and the supervisor
pub const PUBLISH_CAPACITY: usize = 4;

/// Sends `item`, waiting up to `wait` for capacity. Returns false when the item was dropped.
pub async fn offer<T>(tx: &mpsc::Sender<T>, item: T, wait: Duration) -> bool {
    match tx.send_timeout(item, wait).await {
        Ok(()) => true,
        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
            warn!("Channel full, dropping message");
            false
        }
        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
            warn!("Channel closed, dropping message");
            false
        }
    }
}

/// The two application channels as seen from the connectivity core
#[derive(Debug)]
pub struct MessageBus {
    /// Decoded inbound messages for the lighting and other subsystems
    pub incoming: mpsc::Sender<String>,
    /// Application messages waiting to be published
    pub outgoing_rx: mpsc::Receiver<String>,
    /// Producer side of `outgoing_rx`, used for acknowledgements and report requests
    pub outgoing: mpsc::Sender<String>,
}

/// The application side of a [`MessageBus`]
#[derive(Debug)]
pub struct ApplicationEnd {
    pub incoming_rx: mpsc::Receiver<String>,
    pub outgoing: mpsc::Sender<String>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> (Self, ApplicationEnd) {
        let (incoming, incoming_rx) = mpsc::channel(capacity);
        let (outgoing, outgoing_rx) = mpsc::channel(capacity);
        let app = ApplicationEnd {
            incoming_rx,
            outgoing: outgoing.clone(),
        };
        (
            Self {
                incoming,
                outgoing_rx,
                outgoing,
            },
            app,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn offer_drops_when_full() {
        let (tx, mut rx) = mpsc::channel::<u8>(1);
        assert!(offer(&tx, 1, OFFER_WAIT).await);
        assert!(!offer(&tx, 2, OFFER_WAIT).await);
        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());
    }
}
