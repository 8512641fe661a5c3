//! # Fleetprov Client
//!
//! Exchanges a claim credential for a permanent device certificate and a
//! registered thing over MQTT.
//!
//! ## Modules
//!
//! - [`transport`] - Publish/subscribe seam and its MQTT implementation
//! - [`orchestrator`] - Provisioning workflow driver
//! - [`sink`] - Credential file persistence
//! - [`cancel`] - Cooperative cancellation
//! - [`config`] - File and command-line configuration

pub mod cancel;
pub mod config;
pub mod orchestrator;
pub mod sink;
pub mod transport;

pub use cancel::{CancelHandle, CancelSignal};
pub use config::{ClientConfig, ConfigFile};
pub use orchestrator::{OrchestratorConfig, Provisioner, StopGuard};
pub use sink::{CredentialSink, FileCredentialSink, PersistedCredentials};
pub use transport::{InboundMessage, QoS, SubscriptionHandle, Transport, TransportError};
