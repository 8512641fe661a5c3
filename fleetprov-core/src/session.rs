//! Provisioning session state.
//!
//! A session moves through a fixed sequence of stages and ends in exactly one
//! terminal outcome. The terminal slot is shared with asynchronous fault paths
//! and resolves first-writer-wins.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::error::ProvisionError;
use crate::request::{
    decode_accepted, CreateCertificateResponse, ProvisioningPath, RegisterThingResponse,
    RequestKind,
};

/// Workflow stages in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connecting,
    SubscribingCredential,
    PublishingCredentialRequest,
    AwaitingCredentialResponse,
    SubscribingRegister,
    PublishingRegisterRequest,
    AwaitingRegisterResponse,
    Succeeded,
    Failed,
}

impl Stage {
    /// Returns true once the session has an outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// The stage that follows this one on the success path.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Connecting => Some(Self::SubscribingCredential),
            Self::SubscribingCredential => Some(Self::PublishingCredentialRequest),
            Self::PublishingCredentialRequest => Some(Self::AwaitingCredentialResponse),
            Self::AwaitingCredentialResponse => Some(Self::SubscribingRegister),
            Self::SubscribingRegister => Some(Self::PublishingRegisterRequest),
            Self::PublishingRegisterRequest => Some(Self::AwaitingRegisterResponse),
            Self::AwaitingRegisterResponse => Some(Self::Succeeded),
            Self::Succeeded | Self::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Credential material carried from one stage to the next.
#[derive(Debug, Clone, Default)]
pub struct CredentialBundle {
    pub certificate_ownership_token: String,
    pub certificate_id: Option<String>,
    pub certificate_pem: Option<String>,
    /// Only present on the key-pair path.
    pub private_key_pem: Option<String>,
    /// Set once RegisterThing succeeds.
    pub thing_name: Option<String>,
    /// The credential response as received; PEM blocks are extracted from it.
    pub raw_response: String,
}

impl CredentialBundle {
    /// Build a bundle from an accepted certificate-creation payload.
    ///
    /// The ownership token is always required. The key-pair path additionally
    /// requires the certificate and the private key.
    pub fn from_credential_response(
        path: &ProvisioningPath,
        payload: &[u8],
    ) -> Result<Self, ProvisionError> {
        let kind = path.credential_request();
        let response: CreateCertificateResponse = decode_accepted(kind, payload)?;

        let token = response
            .certificate_ownership_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| missing(kind, "certificateOwnershipToken"))?;

        if path.receives_private_key() {
            if response.certificate_pem.is_none() {
                return Err(missing(kind, "certificatePem"));
            }
            if response.private_key.is_none() {
                return Err(missing(kind, "privateKey"));
            }
        }

        Ok(Self {
            certificate_ownership_token: token,
            certificate_id: response.certificate_id,
            certificate_pem: response.certificate_pem,
            private_key_pem: if path.receives_private_key() {
                response.private_key
            } else {
                None
            },
            thing_name: None,
            raw_response: String::from_utf8_lossy(payload).into_owned(),
        })
    }
}

fn missing(kind: RequestKind, field: &str) -> ProvisionError {
    ProvisionError::MalformedPayload {
        kind,
        reason: format!("missing {field}"),
    }
}

/// Terminal success value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningOutcome {
    pub thing_name: String,
    pub certificate_id: Option<String>,
    pub device_configuration: BTreeMap<String, String>,
    /// Credential files written, certificate first.
    pub written: Vec<PathBuf>,
}

impl ProvisioningOutcome {
    /// Build the outcome from an accepted RegisterThing payload.
    pub fn from_register_response(
        bundle: &CredentialBundle,
        payload: &[u8],
    ) -> Result<Self, ProvisionError> {
        let response: RegisterThingResponse = decode_accepted(RequestKind::RegisterThing, payload)?;
        let thing_name = response
            .thing_name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| missing(RequestKind::RegisterThing, "thingName"))?;

        Ok(Self {
            thing_name,
            certificate_id: bundle.certificate_id.clone(),
            device_configuration: response.device_configuration,
            written: Vec::new(),
        })
    }
}

/// Single-assignment terminal result shared across the workflow.
#[derive(Debug, Clone, Default)]
pub struct TerminalSlot {
    inner: Arc<OnceLock<Result<ProvisioningOutcome, ProvisionError>>>,
}

impl TerminalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the terminal result. Returns false if one was already recorded.
    pub fn resolve(&self, result: Result<ProvisioningOutcome, ProvisionError>) -> bool {
        self.inner.set(result).is_ok()
    }

    /// The recorded result, if any.
    pub fn get(&self) -> Option<&Result<ProvisioningOutcome, ProvisionError>> {
        self.inner.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// One device bootstrap attempt.
///
/// Mutated only by the orchestrator.
#[derive(Debug)]
pub struct ProvisioningSession {
    path: ProvisioningPath,
    template_name: String,
    parameters: BTreeMap<String, String>,
    stage: Stage,
    bundle: Option<CredentialBundle>,
    terminal: TerminalSlot,
}

impl ProvisioningSession {
    #[must_use]
    pub fn new(
        path: ProvisioningPath,
        template_name: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            path,
            template_name: template_name.into(),
            parameters,
            stage: Stage::Connecting,
            bundle: None,
            terminal: TerminalSlot::new(),
        }
    }

    pub fn path(&self) -> &ProvisioningPath {
        &self.path
    }

    pub fn template_name(&self) -> &str {
        &self.template_name
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// A handle to the terminal slot for fault paths running off the main task.
    pub fn terminal(&self) -> TerminalSlot {
        self.terminal.clone()
    }

    /// Move to the next stage. No-op once terminal.
    pub fn advance(&mut self) -> Stage {
        if let Some(next) = self.stage.next() {
            tracing::info!(from = %self.stage, to = %next, "stage transition");
            self.stage = next;
        }
        self.stage
    }

    pub fn set_bundle(&mut self, bundle: CredentialBundle) {
        self.bundle = Some(bundle);
    }

    pub fn bundle(&self) -> Option<&CredentialBundle> {
        self.bundle.as_ref()
    }

    /// Hand the bundle over to its consumer.
    pub fn take_bundle(&mut self) -> Option<CredentialBundle> {
        self.bundle.take()
    }

    /// Record the terminal result and return the one that stands.
    ///
    /// If an asynchronous fault path resolved the slot first, its result wins.
    pub fn finish(
        &mut self,
        result: Result<ProvisioningOutcome, ProvisionError>,
    ) -> Result<ProvisioningOutcome, ProvisionError> {
        self.terminal.resolve(result.clone());
        let recorded = self.terminal.get().cloned().unwrap_or(result);
        self.stage = if recorded.is_ok() {
            Stage::Succeeded
        } else {
            Stage::Failed
        };
        self.bundle = None;
        recorded
    }
}
