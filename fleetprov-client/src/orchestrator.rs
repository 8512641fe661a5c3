//! Provisioning orchestration.
//!
//! Drives one [`ProvisioningSession`] from connection to a terminal outcome:
//!
//! 1. Connect and wait for the broker to accept the connection
//! 2. Subscribe to the credential request's accepted/rejected pair
//! 3. Publish the credential request and wait for the correlated response
//! 4. Subscribe to the RegisterThing pair for the template
//! 5. Publish RegisterThing and wait for the correlated response
//! 6. Persist the credentials the service issued
//!
//! Each step starts only after the previous one is confirmed. Any fault ends
//! the run; the transport is stopped exactly once on every path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetprov_core::request::RegisterThingRequest;
use fleetprov_core::{
    CorrelationRegistry, CredentialBundle, ProvisionError, ProvisioningOutcome,
    ProvisioningSession, RequestCorrelation, RequestKind, Stage, TopicTable, WaitPolicy,
};
use tokio::sync::mpsc;

use crate::cancel::CancelHandle;
use crate::sink::CredentialSink;
use crate::transport::{InboundMessage, QoS, SubscriptionHandle, Transport};

/// Default time allowed for the broker to accept the connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for the broker to acknowledge a subscription.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timing and delivery policy for a run.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub credential_wait: WaitPolicy,
    pub register_wait: WaitPolicy,
    pub qos: QoS,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            credential_wait: WaitPolicy::credential(),
            register_wait: WaitPolicy::register(),
            qos: QoS::AtLeastOnce,
        }
    }
}

/// Calls [`Transport::stop`] at most once.
pub struct StopGuard<T: ?Sized> {
    transport: Arc<T>,
    stopped: AtomicBool,
}

impl<T: Transport + ?Sized> StopGuard<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            stopped: AtomicBool::new(false),
        }
    }

    /// Stop the transport unless someone already did. Returns true for the
    /// caller that actually stopped it.
    pub async fn stop_once(&self) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        tracing::info!("stopping client");
        if let Err(e) = self.transport.stop().await {
            tracing::warn!("error while stopping client: {}", e);
        }
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Runs the provisioning workflow over a transport.
///
/// A provisioner drives a single session; `run` consumes it.
pub struct Provisioner<T: ?Sized, S> {
    transport: Arc<T>,
    sink: S,
    config: OrchestratorConfig,
    stop: StopGuard<T>,
    cancel: CancelHandle,
}

impl<T, S> Provisioner<T, S>
where
    T: Transport + ?Sized + 'static,
    S: CredentialSink,
{
    pub fn new(transport: Arc<T>, sink: S, config: OrchestratorConfig) -> Self {
        Self {
            stop: StopGuard::new(transport.clone()),
            transport,
            sink,
            config,
            cancel: CancelHandle::new(),
        }
    }

    /// Handle that aborts the run from outside, e.g. on Ctrl+C.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the workflow to its terminal outcome.
    pub async fn run(
        self,
        mut session: ProvisioningSession,
    ) -> Result<ProvisioningOutcome, ProvisionError> {
        let registry = Arc::new(CorrelationRegistry::new(TopicTable::new(
            session.template_name(),
        )));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(inbound_rx, registry.clone()));

        let result = self.drive(&mut session, &registry, inbound_tx).await;
        let last_stage = session.stage();

        self.stop.stop_once().await;
        dispatcher.abort();

        let recorded = session.finish(result);
        match &recorded {
            Ok(outcome) => {
                tracing::info!(thing_name = %outcome.thing_name, "provisioning succeeded");
            }
            Err(e) => {
                tracing::error!(stage = %last_stage, kind = %e.kind(), "provisioning failed: {}", e);
            }
        }
        recorded
    }

    async fn drive(
        &self,
        session: &mut ProvisioningSession,
        registry: &CorrelationRegistry,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<ProvisioningOutcome, ProvisionError> {
        debug_assert_eq!(session.stage(), Stage::Connecting);
        self.connect(inbound).await?;
        tracing::info!("connected");

        // Credential request: accepted/rejected must be live before publishing.
        session.advance();
        let credential = registry.register(session.path().credential_request());
        let mut subscriptions = self.subscribe_pair(&credential).await?;

        session.advance();
        let payload = session.path().credential_request_payload()?;

        session.advance();
        let response = self
            .request(session, &credential, payload, self.config.credential_wait)
            .await?;
        let bundle = CredentialBundle::from_credential_response(session.path(), &response)?;
        tracing::info!(
            certificate_id = bundle.certificate_id.as_deref().unwrap_or("-"),
            "certificate issued"
        );
        let register_request = RegisterThingRequest {
            template_name: session.template_name().to_string(),
            certificate_ownership_token: bundle.certificate_ownership_token.clone(),
            parameters: session.parameters().clone(),
        };
        session.set_bundle(bundle);

        // RegisterThing.
        session.advance();
        let register = registry.register(RequestKind::RegisterThing);
        subscriptions.extend(self.subscribe_pair(&register).await?);

        session.advance();
        let payload = register_request.to_payload()?;

        session.advance();
        let response = self
            .request(session, &register, payload, self.config.register_wait)
            .await?;

        let mut bundle = session.take_bundle().ok_or_else(|| {
            ProvisionError::MalformedPayload {
                kind: RequestKind::RegisterThing,
                reason: "credential bundle missing".to_string(),
            }
        })?;
        let mut outcome = ProvisioningOutcome::from_register_response(&bundle, &response)?;
        bundle.thing_name = Some(outcome.thing_name.clone());
        tracing::info!(thing_name = %outcome.thing_name, "thing registered");

        // A signed CSR may come back without the certificate body; the
        // device then fetches it separately and nothing is written here.
        if bundle.certificate_pem.is_some() {
            let persisted = self
                .sink
                .persist(&bundle.raw_response, session.path().receives_private_key())?;
            outcome.written.push(persisted.certificate);
            outcome.written.extend(persisted.private_key);
        } else {
            tracing::info!("response carried no certificate, nothing to persist");
        }

        tracing::debug!(count = subscriptions.len(), "releasing subscriptions with the session");
        Ok(outcome)
    }

    async fn connect(
        &self,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<(), ProvisionError> {
        let signal = self.cancel.signal();
        let timeout = self.config.connect_timeout;

        tokio::select! {
            result = tokio::time::timeout(timeout, self.transport.connect(inbound)) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ProvisionError::ConnectionFault(e.to_string())),
                Err(_) => Err(ProvisionError::ConnectionFault(format!(
                    "not connected after {}s",
                    timeout.as_secs_f64()
                ))),
            },
            _ = signal.cancelled() => {
                Err(ProvisionError::ConnectionFault("cancelled before connecting".to_string()))
            }
        }
    }

    /// Subscribe to accepted, then rejected, each confirmed before the next.
    async fn subscribe_pair(
        &self,
        correlation: &RequestCorrelation,
    ) -> Result<Vec<SubscriptionHandle>, ProvisionError> {
        let topics = correlation.topics();
        let mut handles = Vec::with_capacity(2);
        for topic in [&topics.accepted, &topics.rejected] {
            tracing::info!(topic = %topic, "subscribing");
            handles.push(self.subscribe(correlation.kind(), topic).await?);
        }
        Ok(handles)
    }

    /// One subscription, bounded by the subscribe timeout and cancellable.
    async fn subscribe(
        &self,
        kind: RequestKind,
        topic: &str,
    ) -> Result<SubscriptionHandle, ProvisionError> {
        let signal = self.cancel.signal();
        let timeout = self.config.subscribe_timeout;
        let fault = |reason: String| ProvisionError::SubscribeFault {
            topic: topic.to_string(),
            reason,
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, self.transport.subscribe(topic, self.config.qos)) => {
                match result {
                    Ok(subscribed) => subscribed.map_err(|e| fault(e.to_string())),
                    Err(_) => Err(fault(format!(
                        "not acknowledged after {}s",
                        timeout.as_secs_f64()
                    ))),
                }
            }
            _ = signal.cancelled() => Err(ProvisionError::Cancelled { kind }),
        }
    }

    /// Publish a request and wait for its correlated response.
    ///
    /// The publish outcome races the wait. A publish failure ends the request
    /// at once; a response (or the wait's timeout) ends it even while the
    /// publish is still unacknowledged.
    async fn request(
        &self,
        session: &ProvisioningSession,
        correlation: &RequestCorrelation,
        payload: Vec<u8>,
        policy: WaitPolicy,
    ) -> Result<Vec<u8>, ProvisionError> {
        let kind = correlation.kind();
        let topic = correlation.topics().request.as_str();
        let terminal = session.terminal();
        let signal = self.cancel.signal();

        tracing::info!(%kind, topic, "publishing request");
        let publish = async {
            match self.transport.publish(topic, payload, self.config.qos).await {
                Ok(()) => {
                    tracing::info!(%kind, "published request");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(%kind, "failed to publish request: {}", e);
                    let fault = ProvisionError::PublishFault {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    };
                    terminal.resolve(Err(fault.clone()));
                    Err(fault)
                }
            }
        };
        let wait = correlation.wait(policy, signal.cancelled());
        tokio::pin!(publish, wait);

        let response = tokio::select! {
            biased;
            published = &mut publish => {
                published?;
                wait.await
            }
            response = &mut wait => {
                if response.is_ok() {
                    tracing::debug!(%kind, "response arrived before publish acknowledgement");
                }
                response
            }
        };
        response?.into_accepted(kind)
    }
}

/// Route inbound messages into their correlations until the transport drops.
async fn dispatch(
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    registry: Arc<CorrelationRegistry>,
) {
    while let Some(message) = inbound.recv().await {
        let delivery = registry.route(&message.topic, message.payload);
        tracing::debug!(topic = %message.topic, ?delivery, "inbound message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingTransport {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn connect(
            &self,
            _inbound: mpsc::UnboundedSender<InboundMessage>,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            topic: &str,
            qos: QoS,
        ) -> Result<SubscriptionHandle, TransportError> {
            Ok(SubscriptionHandle {
                topic: topic.to_string(),
                qos,
            })
        }

        async fn publish(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _qos: QoS,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_guard_stops_once() {
        let transport = Arc::new(CountingTransport::default());
        let guard = Arc::new(StopGuard::new(transport.clone()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            tasks.push(tokio::spawn(async move { guard.stop_once().await }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(guard.is_stopped());
        assert_eq!(transport.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_config_budgets() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.credential_wait.max_attempts, 10);
        assert_eq!(config.register_wait.max_attempts, 20);
        assert_eq!(config.credential_wait.poll_interval, Duration::from_secs(1));
        assert_eq!(config.qos, QoS::AtLeastOnce);
    }
}
