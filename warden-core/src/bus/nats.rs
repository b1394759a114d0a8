use std::fmt;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{Bus, BusMessage, BusSubscription};
use crate::error::{CoreError, Result};

/// Production bus over a NATS connection.
pub struct NatsBus {
    client: async_nats::Client,
}

impl fmt::Debug for NatsBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsBus")
            .field("state", &self.client.connection_state())
            .finish()
    }
}

impl NatsBus {
    /// Connect at startup. A refused connection is a startup-class error;
    /// the caller exits 1 rather than limping along without a bus.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| CoreError::Startup(format!("bus connect {url}: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(subject.to_owned(), payload.into())
            .await
            .map_err(|e| CoreError::Bus(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_owned())
            .await
            .map_err(|e| CoreError::Bus(e.to_string()))?;

        let (tx, out) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let delivered = tx.send(BusMessage {
                    subject: message.subject.to_string(),
                    payload: message.payload.to_vec(),
                });
                if delivered.is_err() {
                    // Subscription handle dropped; unsubscribe by letting
                    // the subscriber fall out of scope.
                    break;
                }
            }
        });
        Ok(BusSubscription::new(out))
    }
}
