//! CLI argument parsing.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use fleetprov_client::ConfigFile;

/// Fleet provisioning client - trades a claim certificate for a device identity.
#[derive(Parser, Debug)]
#[command(name = "fleetprov", version)]
pub struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Broker endpoint host
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Broker port
    #[arg(long)]
    pub port: Option<u16>,

    /// MQTT client ID
    #[arg(long)]
    pub client_id: Option<String>,

    /// Claim certificate used to authenticate the connection
    #[arg(long, value_name = "PATH")]
    pub enrollment_cert: Option<PathBuf>,

    /// Private key of the claim certificate
    #[arg(long, value_name = "PATH")]
    pub enrollment_key: Option<PathBuf>,

    /// Root CA bundle for the broker
    #[arg(long, value_name = "PATH")]
    pub root_ca: Option<PathBuf>,

    /// Certificate signing request; the service generates a key when omitted
    #[arg(long, value_name = "PATH")]
    pub csr: Option<PathBuf>,

    /// Provisioning template name
    #[arg(long)]
    pub template: Option<String>,

    /// Template parameters as a JSON object, e.g. '{"SerialNumber":"SN-1"}'
    #[arg(long, value_name = "JSON", value_parser = parse_parameters)]
    pub parameters: Option<BTreeMap<String, String>>,

    /// File the issued certificate is appended to
    #[arg(long, value_name = "PATH")]
    pub out_cert: Option<PathBuf>,

    /// File the issued private key is appended to
    #[arg(long, value_name = "PATH")]
    pub out_key: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Parse a JSON object of string values.
fn parse_parameters(s: &str) -> Result<BTreeMap<String, String>, String> {
    serde_json::from_str(s).map_err(|e| format!("expected a JSON object of strings: {e}"))
}

impl Args {
    /// Values given on the command line, for layering over the config file.
    pub fn overrides(&self) -> ConfigFile {
        ConfigFile {
            endpoint: self.endpoint.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            enrollment_certificate: self.enrollment_cert.clone(),
            enrollment_private_key: self.enrollment_key.clone(),
            root_ca: self.root_ca.clone(),
            csr: self.csr.clone(),
            template_name: self.template.clone(),
            parameters: self.parameters.clone().unwrap_or_default(),
            certificate_out: self.out_cert.clone(),
            private_key_out: self.out_key.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_args(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(args)
    }

    #[test]
    fn test_no_args() {
        let args = parse_args(&["fleetprov"]).unwrap();
        assert!(args.config.is_none());
        assert!(!args.verbose);
        assert_eq!(args.overrides(), ConfigFile::default());
    }

    #[test]
    fn test_overrides_from_flags() {
        let args = parse_args(&[
            "fleetprov",
            "--endpoint",
            "example-ats.iot.eu-west-1.amazonaws.com",
            "--port",
            "443",
            "--template",
            "FleetTemplate",
            "--out-cert",
            "device.pem",
            "--csr",
            "device.csr",
        ])
        .unwrap();

        let overrides = args.overrides();
        assert_eq!(
            overrides.endpoint.as_deref(),
            Some("example-ats.iot.eu-west-1.amazonaws.com")
        );
        assert_eq!(overrides.port, Some(443));
        assert_eq!(overrides.template_name.as_deref(), Some("FleetTemplate"));
        assert_eq!(overrides.certificate_out, Some(PathBuf::from("device.pem")));
        assert_eq!(overrides.csr, Some(PathBuf::from("device.csr")));
        assert!(overrides.private_key_out.is_none());
    }

    #[test]
    fn test_parameters_json() {
        let args = parse_args(&[
            "fleetprov",
            "--parameters",
            r#"{"License":"123","SerialNumber":"SN-1"}"#,
        ])
        .unwrap();

        let parameters = args.overrides().parameters;
        assert_eq!(parameters.len(), 2);
        assert_eq!(parameters["License"], "123");
    }

    #[test]
    fn test_parameters_must_be_string_object() {
        assert!(parse_args(&["fleetprov", "--parameters", "[1,2]"]).is_err());
        assert!(parse_args(&["fleetprov", "--parameters", r#"{"n":1}"#]).is_err());
    }

    #[test]
    fn test_invalid_port_fails() {
        assert!(parse_args(&["fleetprov", "--port", "99999"]).is_err());
    }

    #[test]
    fn test_verbose_short_flag() {
        let args = parse_args(&["fleetprov", "-v", "--config", "/etc/fleetprov.toml"]).unwrap();
        assert!(args.verbose);
        assert_eq!(args.config, Some(PathBuf::from("/etc/fleetprov.toml")));
    }
}
