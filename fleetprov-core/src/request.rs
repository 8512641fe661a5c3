//! Request kinds, provisioning paths and wire payloads.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

// ============================================================================
// Core Types
// ============================================================================

/// The three request/response exchanges of the provisioning protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Ask the service to generate a key pair and certificate.
    CreateKeysAndCertificate,
    /// Ask the service to sign a device-generated CSR.
    CreateCertificateFromCsr,
    /// Register the thing against a provisioning template.
    RegisterThing,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateKeysAndCertificate => "CreateKeysAndCertificate",
            Self::CreateCertificateFromCsr => "CreateCertificateFromCsr",
            Self::RegisterThing => "RegisterThing",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of a request's topic pair a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Accepted,
    Rejected,
}

/// How the device obtains its permanent certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningPath {
    /// No CSR supplied: the service generates the private key.
    KeyPair,
    /// The device supplies a PEM-encoded certificate signing request.
    Csr { pem: String },
}

impl ProvisioningPath {
    /// The request kind used to obtain the certificate on this path.
    pub fn credential_request(&self) -> RequestKind {
        match self {
            Self::KeyPair => RequestKind::CreateKeysAndCertificate,
            Self::Csr { .. } => RequestKind::CreateCertificateFromCsr,
        }
    }

    /// Whether the service hands back a private key on this path.
    pub fn receives_private_key(&self) -> bool {
        matches!(self, Self::KeyPair)
    }

    /// Serialized credential request body for this path.
    pub fn credential_request_payload(&self) -> Result<Vec<u8>, ProvisionError> {
        let encoded = match self {
            Self::KeyPair => serde_json::to_vec(&CreateKeysAndCertificateRequest::default()),
            Self::Csr { pem } => serde_json::to_vec(&CreateCertificateFromCsrRequest {
                certificate_signing_request: pem.clone(),
            }),
        };
        encoded.map_err(|e| ProvisionError::InvalidConfig(format!("encode request: {e}")))
    }
}

// ============================================================================
// Requests
// ============================================================================

/// CreateKeysAndCertificate carries no fields.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateKeysAndCertificateRequest {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCertificateFromCsrRequest {
    pub certificate_signing_request: String,
}

/// RegisterThing request.
///
/// The template name selects the topic; parameters are passed through
/// untouched.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterThingRequest {
    #[serde(skip)]
    pub template_name: String,
    pub certificate_ownership_token: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl RegisterThingRequest {
    pub fn to_payload(&self) -> Result<Vec<u8>, ProvisionError> {
        serde_json::to_vec(self)
            .map_err(|e| ProvisionError::InvalidConfig(format!("encode request: {e}")))
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Accepted response for both certificate-creation requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCertificateResponse {
    #[serde(default)]
    pub certificate_id: Option<String>,
    #[serde(default)]
    pub certificate_pem: Option<String>,
    /// Only present for CreateKeysAndCertificate.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate_ownership_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterThingResponse {
    #[serde(default)]
    pub thing_name: Option<String>,
    #[serde(default)]
    pub device_configuration: BTreeMap<String, String>,
}

/// Body published on every rejected topic.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ErrorResponse {
    /// Turn a rejected payload into the error it represents.
    ///
    /// An unparseable body still yields a rejection, with the raw text as the
    /// message.
    pub fn into_error(kind: RequestKind, payload: &[u8]) -> ProvisionError {
        match serde_json::from_slice::<ErrorResponse>(payload) {
            Ok(body) => ProvisionError::RejectedByService {
                kind,
                code: body.error_code.unwrap_or_default(),
                message: body.error_message.unwrap_or_default(),
                status: body.status_code.unwrap_or_default(),
            },
            Err(_) => ProvisionError::RejectedByService {
                kind,
                code: String::new(),
                message: String::from_utf8_lossy(payload).into_owned(),
                status: 0,
            },
        }
    }
}

/// Decode an accepted payload, mapping failures to [`ProvisionError::MalformedPayload`].
pub fn decode_accepted<T: for<'de> Deserialize<'de>>(
    kind: RequestKind,
    payload: &[u8],
) -> Result<T, ProvisionError> {
    serde_json::from_slice(payload).map_err(|e| ProvisionError::MalformedPayload {
        kind,
        reason: e.to_string(),
    })
}
