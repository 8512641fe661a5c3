//! fleetprov - device fleet provisioning client.
//!
//! Connects with a claim certificate, obtains a permanent certificate,
//! registers the thing and writes the credentials to disk. Exits 0 on
//! success and with a per-failure-kind code otherwise.

mod args;

use std::sync::Arc;

use anyhow::Context;
use args::Args;
use clap::Parser;
use fleetprov_client::transport::MqttTransport;
use fleetprov_client::{ClientConfig, ConfigFile, FileCredentialSink, Provisioner};
use fleetprov_core::{FailureKind, ProvisionError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let exit_code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            let kind = e
                .downcast_ref::<ProvisionError>()
                .map(ProvisionError::kind)
                .unwrap_or(FailureKind::Config);
            tracing::error!(kind = %kind, "fleetprov error: {:#}", e);
            kind.exit_code()
        }
    };

    std::process::exit(exit_code);
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let file = match &args.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::load_default()?,
    };
    let config = ClientConfig::try_from(file.merge(args.overrides()))?;
    let session = config.session()?;

    tracing::info!(
        endpoint = %config.endpoint,
        client_id = %config.client_id,
        template = %config.template_name,
        csr = config.csr.is_some(),
        "provisioning started"
    );

    let transport = MqttTransport::new(&config.mqtt_settings())
        .map_err(|e| ProvisionError::ConnectionFault(e.to_string()))
        .context("Failed to set up MQTT client")?;
    let sink = FileCredentialSink::new(&config.certificate_out, &config.private_key_out);
    let provisioner = Provisioner::new(Arc::new(transport), sink, config.orchestrator_config());

    let cancel = provisioner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });

    match provisioner.run(session).await {
        Ok(outcome) => {
            println!("Thing name: {}", outcome.thing_name);
            Ok(0)
        }
        // Already logged by the orchestrator.
        Err(e) => Ok(e.kind().exit_code()),
    }
}
