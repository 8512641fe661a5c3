//! Credential persistence.

use std::io::Write;
use std::path::{Path, PathBuf};

use fleetprov_core::pem;
use fleetprov_core::ProvisionError;

/// Where credential material ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedCredentials {
    pub certificate: PathBuf,
    /// `None` when the device supplied its own key.
    pub private_key: Option<PathBuf>,
}

/// Durably stores the credentials from a certificate response.
pub trait CredentialSink: Send + Sync {
    /// Extract PEM blocks from `raw_response` and store them.
    ///
    /// The private key is only extracted and written when `with_private_key`
    /// is set.
    fn persist(
        &self,
        raw_response: &str,
        with_private_key: bool,
    ) -> Result<PersistedCredentials, ProvisionError>;
}

/// Appends PEM blocks to a certificate file and a key file.
#[derive(Debug, Clone)]
pub struct FileCredentialSink {
    certificate_path: PathBuf,
    private_key_path: PathBuf,
}

impl FileCredentialSink {
    pub fn new(certificate_path: impl Into<PathBuf>, private_key_path: impl Into<PathBuf>) -> Self {
        Self {
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
        }
    }

    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }

    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }
}

fn append(path: &Path, content: &str) -> Result<(), ProvisionError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ProvisionError::persistence(parent, e))?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ProvisionError::persistence(path, e))?;
    file.write_all(content.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| ProvisionError::persistence(path, e))
}

impl CredentialSink for FileCredentialSink {
    fn persist(
        &self,
        raw_response: &str,
        with_private_key: bool,
    ) -> Result<PersistedCredentials, ProvisionError> {
        // Extract everything before touching disk so a bad payload writes nothing.
        let certificate = pem::extract_certificate(raw_response)?;
        let private_key = if with_private_key {
            Some(pem::extract_private_key(raw_response)?)
        } else {
            None
        };

        append(&self.certificate_path, &certificate)?;
        tracing::info!(path = %self.certificate_path.display(), "certificate written");

        let Some(private_key) = private_key else {
            return Ok(PersistedCredentials {
                certificate: self.certificate_path.clone(),
                private_key: None,
            });
        };

        append(&self.private_key_path, &private_key)?;

        // Set restrictive permissions on key
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.private_key_path,
                std::fs::Permissions::from_mode(0o600),
            )
            .map_err(|e| ProvisionError::persistence(&self.private_key_path, e))?;
        }
        tracing::info!(path = %self.private_key_path.display(), "private key written");

        Ok(PersistedCredentials {
            certificate: self.certificate_path.clone(),
            private_key: Some(self.private_key_path.clone()),
        })
    }
}
