use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{Bus, BusMessage, BusSubscription};
use crate::error::Result;

/// In-process bus that fans subjects out over broadcast channels.
///
/// Matches the delivery contract of the production bus closely enough for
/// tests and single-process demos: subscribers only see messages published
/// after they subscribed, and a slow subscriber loses messages rather than
/// stalling the publisher.
pub struct InProcBus {
    topics: DashMap<String, broadcast::Sender<BusMessage>>,
    capacity: usize,
}

impl fmt::Debug for InProcBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcBus")
            .field("subjects", &self.topics.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl InProcBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, subject: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(subject.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl Bus for InProcBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let message = BusMessage {
            subject: subject.to_owned(),
            payload,
        };
        // No receivers is not an error: publishes to an idle subject vanish,
        // as they do on the wire.
        let _ = self.sender(subject).send(message);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription> {
        let mut rx = self.sender(subject).subscribe();
        let (tx, out) = mpsc::unbounded_channel();
        let subject = subject.to_owned();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(subject = %subject, skipped, "in-proc subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(BusSubscription::new(out))
    }
}
