//! Publish/subscribe transport seam.
//!
//! The orchestrator only needs four operations from the broker connection.
//! [`MqttTransport`] is the production implementation; tests drive the
//! orchestrator through an in-memory broker.

mod mqtt;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use mqtt::{MqttSettings, MqttTransport};

/// Delivery guarantee requested for a subscription or publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// An active subscription.
///
/// Released by transport teardown; there is no explicit unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub topic: String,
    pub qos: QoS,
}

/// Transport failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker refused the subscription.
    #[error("subscription refused by broker")]
    SubscribeRefused,

    /// The request could not be handed to the connection.
    #[error("request failed: {0}")]
    Request(String),

    /// The transport stopped before the operation completed.
    #[error("transport closed")]
    Closed,
}

/// Broker connection used by the orchestrator.
///
/// Subscribe and publish calls made before the connection is established are
/// queued by the implementation. `stop` is called at most once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting. Resolves once the broker accepts the connection.
    ///
    /// Every message arriving on a subscribed topic is sent to `inbound`.
    async fn connect(&self, inbound: mpsc::UnboundedSender<InboundMessage>)
        -> Result<(), TransportError>;

    /// Subscribe and wait for the broker's acknowledgement.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubscriptionHandle, TransportError>;

    /// Publish and wait for the delivery outcome.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError>;

    /// Disconnect and release all subscriptions.
    async fn stop(&self) -> Result<(), TransportError>;
}
