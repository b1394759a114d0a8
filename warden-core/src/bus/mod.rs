//! Topic pub/sub capability.
//!
//! At-least-once delivery, no ordering guarantee across subjects. The
//! production implementation rides NATS; the in-process implementation fans
//! out over broadcast channels and exists for tests, demos, and
//! single-process deployments.

mod inproc;
mod nats;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::error::{CoreError, Result};

pub use inproc::InProcBus;
pub use nats::NatsBus;

/// One delivered message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(CoreError::from)
    }
}

/// Live subscription handle. Dropping it cancels delivery.
#[derive(Debug)]
pub struct BusSubscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl BusSubscription {
    /// Wrap a delivery channel. Custom `Bus` implementations feed the
    /// sending side from their transport.
    pub fn new(rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the underlying transport is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Non-blocking drain used by tests.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// Message bus capability.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription>;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn Bus,
    subject: &str,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(subject, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inproc_round_trip_json() {
        let bus = InProcBus::new(16);
        let mut sub = bus.subscribe("findings").await.expect("subscribe");

        publish_json(&bus, "findings", &serde_json::json!({"severity": "high"}))
            .await
            .expect("publish");

        let msg = sub.recv().await.expect("message");
        let value: serde_json::Value = msg.json().expect("decode");
        assert_eq!(value["severity"], "high");
    }

    #[tokio::test]
    async fn subscriptions_are_per_subject() {
        let bus = InProcBus::new(16);
        let mut telemetry = bus.subscribe("telemetry").await.expect("subscribe");
        let mut findings = bus.subscribe("findings").await.expect("subscribe");

        bus.publish("telemetry", b"t".to_vec()).await.expect("publish");

        assert_eq!(telemetry.recv().await.expect("message").payload, b"t");
        assert!(findings.try_recv().is_none());
    }
}
