//! Client configuration.
//!
//! Settings come from a TOML file and are overlaid with command-line values.
//! The file lives in the platform config directory unless `--config` points
//! elsewhere. Relative paths in the file are resolved against the file's own
//! directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fleetprov_core::{ProvisionError, ProvisioningPath, ProvisioningSession, WaitPolicy};
use serde::{Deserialize, Serialize};

use crate::orchestrator::OrchestratorConfig;
use crate::transport::{MqttSettings, QoS};

pub const DEFAULT_PORT: u16 = 8883;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SUBSCRIBE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Shortest keep-alive the broker accepts.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Raw settings as written in the config file or given on the command line.
///
/// Every field is optional so a file and a set of overrides can be layered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub enrollment_certificate: Option<PathBuf>,
    pub enrollment_private_key: Option<PathBuf>,
    pub root_ca: Option<PathBuf>,
    /// Signing request to use instead of a server-generated key.
    pub csr: Option<PathBuf>,
    pub template_name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    pub certificate_out: Option<PathBuf>,
    pub private_key_out: Option<PathBuf>,
    pub keep_alive_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub subscribe_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub credential_attempts: Option<u32>,
    pub register_attempts: Option<u32>,
}

impl ConfigFile {
    /// Load a config file, resolving relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let mut file: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        if let Some(base) = path.parent() {
            file.resolve_paths(base);
        }
        Ok(file)
    }

    /// Load the default config file, or an empty one if it doesn't exist.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using command line only");
            Ok(Self::default())
        }
    }

    /// Get the path to the default config file.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("com", "fleetprov", "fleetprov")
            .context("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.enrollment_certificate,
            &mut self.enrollment_private_key,
            &mut self.root_ca,
            &mut self.csr,
            &mut self.certificate_out,
            &mut self.private_key_out,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Overlay `overrides` on top of these settings.
    ///
    /// Set values in `overrides` win. Non-empty override parameters replace
    /// the file's parameters as a whole.
    pub fn merge(self, overrides: ConfigFile) -> ConfigFile {
        ConfigFile {
            endpoint: overrides.endpoint.or(self.endpoint),
            port: overrides.port.or(self.port),
            client_id: overrides.client_id.or(self.client_id),
            enrollment_certificate: overrides
                .enrollment_certificate
                .or(self.enrollment_certificate),
            enrollment_private_key: overrides
                .enrollment_private_key
                .or(self.enrollment_private_key),
            root_ca: overrides.root_ca.or(self.root_ca),
            csr: overrides.csr.or(self.csr),
            template_name: overrides.template_name.or(self.template_name),
            parameters: if overrides.parameters.is_empty() {
                self.parameters
            } else {
                overrides.parameters
            },
            certificate_out: overrides.certificate_out.or(self.certificate_out),
            private_key_out: overrides.private_key_out.or(self.private_key_out),
            keep_alive_secs: overrides.keep_alive_secs.or(self.keep_alive_secs),
            connect_timeout_secs: overrides.connect_timeout_secs.or(self.connect_timeout_secs),
            subscribe_timeout_secs: overrides
                .subscribe_timeout_secs
                .or(self.subscribe_timeout_secs),
            poll_interval_ms: overrides.poll_interval_ms.or(self.poll_interval_ms),
            credential_attempts: overrides.credential_attempts.or(self.credential_attempts),
            register_attempts: overrides.register_attempts.or(self.register_attempts),
        }
    }
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, ProvisionError> {
    value.ok_or_else(|| ProvisionError::InvalidConfig(format!("missing required setting `{name}`")))
}

fn positive(value: u32, name: &str) -> Result<u32, ProvisionError> {
    if value == 0 {
        return Err(ProvisionError::InvalidConfig(format!(
            "`{name}` must be at least 1"
        )));
    }
    Ok(value)
}

/// Validated client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,
    pub enrollment_certificate: PathBuf,
    pub enrollment_private_key: PathBuf,
    pub root_ca: PathBuf,
    pub csr: Option<PathBuf>,
    pub template_name: String,
    pub parameters: BTreeMap<String, String>,
    pub certificate_out: PathBuf,
    pub private_key_out: PathBuf,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub poll_interval: Duration,
    pub credential_attempts: u32,
    pub register_attempts: u32,
}

impl TryFrom<ConfigFile> for ClientConfig {
    type Error = ProvisionError;

    fn try_from(file: ConfigFile) -> Result<Self, Self::Error> {
        let keep_alive_secs = file.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS);
        if keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ProvisionError::InvalidConfig(format!(
                "`keep_alive_secs` must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }

        let poll_interval_ms = file.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if poll_interval_ms == 0 {
            return Err(ProvisionError::InvalidConfig(
                "`poll_interval_ms` must be positive".to_string(),
            ));
        }

        let template_name = required(file.template_name, "template_name")?;
        if template_name.is_empty() || template_name.contains(['/', '+', '#']) {
            return Err(ProvisionError::InvalidConfig(format!(
                "invalid template name `{template_name}`"
            )));
        }

        Ok(Self {
            endpoint: required(file.endpoint, "endpoint")?,
            port: file.port.unwrap_or(DEFAULT_PORT),
            client_id: required(file.client_id, "client_id")?,
            enrollment_certificate: required(
                file.enrollment_certificate,
                "enrollment_certificate",
            )?,
            enrollment_private_key: required(
                file.enrollment_private_key,
                "enrollment_private_key",
            )?,
            root_ca: required(file.root_ca, "root_ca")?,
            csr: file.csr,
            template_name,
            parameters: file.parameters,
            certificate_out: required(file.certificate_out, "certificate_out")?,
            private_key_out: required(file.private_key_out, "private_key_out")?,
            keep_alive: Duration::from_secs(keep_alive_secs),
            connect_timeout: Duration::from_secs(
                file.connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            subscribe_timeout: Duration::from_secs(
                file.subscribe_timeout_secs
                    .unwrap_or(DEFAULT_SUBSCRIBE_TIMEOUT_SECS),
            ),
            poll_interval: Duration::from_millis(poll_interval_ms),
            credential_attempts: positive(
                file.credential_attempts
                    .unwrap_or(fleetprov_core::correlation::CREDENTIAL_ATTEMPTS),
                "credential_attempts",
            )?,
            register_attempts: positive(
                file.register_attempts
                    .unwrap_or(fleetprov_core::correlation::REGISTER_ATTEMPTS),
                "register_attempts",
            )?,
        })
    }
}

impl ClientConfig {
    /// Transport settings authenticating with the claim credential.
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            endpoint: self.endpoint.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            keep_alive: self.keep_alive,
            clean_session: false,
            root_ca: self.root_ca.clone(),
            certificate: self.enrollment_certificate.clone(),
            private_key: self.enrollment_private_key.clone(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            connect_timeout: self.connect_timeout,
            subscribe_timeout: self.subscribe_timeout,
            credential_wait: WaitPolicy::new(self.poll_interval, self.credential_attempts),
            register_wait: WaitPolicy::new(self.poll_interval, self.register_attempts),
            qos: QoS::AtLeastOnce,
        }
    }

    /// Build the session, reading the signing request when one is configured.
    pub fn session(&self) -> Result<ProvisioningSession, ProvisionError> {
        let path = match &self.csr {
            Some(csr) => {
                let pem = std::fs::read_to_string(csr).map_err(|e| {
                    ProvisionError::InvalidConfig(format!(
                        "failed to read CSR {}: {e}",
                        csr.display()
                    ))
                })?;
                ProvisioningPath::Csr { pem }
            }
            None => ProvisioningPath::KeyPair,
        };

        Ok(ProvisioningSession::new(
            path,
            self.template_name.clone(),
            self.parameters.clone(),
        ))
    }
}
