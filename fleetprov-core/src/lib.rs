//! # Fleetprov Core
//!
//! Protocol types and request correlation for device fleet provisioning.
//!
//! ## Design Principles
//!
//! This crate performs no filesystem or network IO. It knows the topics, the
//! wire payloads and how responses are correlated to requests; the transport
//! and the credential files live in `fleetprov-client`.
//!
//! ## Modules
//!
//! - [`request`] - Request kinds, provisioning paths and wire payloads
//! - [`topics`] - Topic names and inbound topic routing
//! - [`correlation`] - Single-assignment response slots and the bounded wait
//! - [`session`] - Provisioning session, stages and the terminal slot
//! - [`pem`] - PEM block extraction from raw response text
//! - [`hook`] - Pre-provisioning decision hook contract
//! - [`error`] - Failure taxonomy

pub mod correlation;
pub mod error;
pub mod hook;
pub mod pem;
pub mod request;
pub mod session;
pub mod topics;

pub use correlation::{CorrelationRegistry, Delivery, RequestCorrelation, Response, WaitPolicy};
pub use error::{FailureKind, ProvisionError};
pub use hook::{evaluate_hook, AllowAll, HookDecision, PreProvisioningHook};
pub use request::{Outcome, ProvisioningPath, RequestKind};
pub use session::{
    CredentialBundle, ProvisioningOutcome, ProvisioningSession, Stage, TerminalSlot,
};
pub use topics::{RequestTopics, TopicTable};
