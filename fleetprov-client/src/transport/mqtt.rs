//! MQTT transport over mutual TLS.
//!
//! Operations are acknowledged in the order they were issued, so pending
//! subscribe and publish completions are kept in FIFO queues and resolved as
//! SUBACK / PUBACK packets arrive.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode, TlsConfiguration,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{InboundMessage, QoS, SubscriptionHandle, Transport, TransportError};

/// Capacity of the request channel between client and event loop.
const REQUEST_CAPACITY: usize = 64;

/// Pause between polls after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long `stop` waits for the event loop to drain the disconnect.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

type Completion = oneshot::Sender<Result<(), TransportError>>;

/// Connection settings for [`MqttTransport`].
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub root_ca: PathBuf,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl MqttSettings {
    fn options(&self) -> Result<MqttOptions, TransportError> {
        let read = |path: &PathBuf| {
            std::fs::read(path).map_err(|e| {
                TransportError::Connection(format!("failed to read {}: {e}", path.display()))
            })
        };

        let ca = read(&self.root_ca)?;
        let cert = read(&self.certificate)?;
        let key = read(&self.private_key)?;

        let mut options = MqttOptions::new(&self.client_id, &self.endpoint, self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(self.clean_session)
            .set_transport(rumqttc::Transport::tls_with_config(
                TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: Some((cert, key)),
                },
            ));
        Ok(options)
    }
}

/// Completions waiting on the event loop.
#[derive(Default)]
struct Pending {
    connected: Mutex<Option<Completion>>,
    subscribes: Mutex<VecDeque<Completion>>,
    publishes: Mutex<VecDeque<Completion>>,
}

impl Pending {
    fn push(queue: &Mutex<VecDeque<Completion>>, tx: Completion) {
        queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(tx);
    }

    fn pop_front(queue: &Mutex<VecDeque<Completion>>) -> Option<Completion> {
        queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn pop_back(queue: &Mutex<VecDeque<Completion>>) -> Option<Completion> {
        queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_back()
    }

    fn resolve_connected(&self, result: Result<(), TransportError>) {
        let tx = self
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    /// Fail every in-flight subscribe and publish.
    fn fail_in_flight(&self, error: &TransportError) {
        for queue in [&self.subscribes, &self.publishes] {
            let drained: Vec<Completion> = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for tx in drained {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }
}

/// rumqttc-backed [`Transport`].
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    pending: Arc<Pending>,
    stopping: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Build the transport. Nothing touches the network until `connect`.
    pub fn new(settings: &MqttSettings) -> Result<Self, TransportError> {
        let (client, eventloop) = AsyncClient::new(settings.options()?, REQUEST_CAPACITY);
        Ok(Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            pending: Arc::new(Pending::default()),
            stopping: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

fn connack_result(code: ConnectReturnCode) -> Result<(), TransportError> {
    match code {
        ConnectReturnCode::Success => Ok(()),
        refused => Err(TransportError::Connection(format!(
            "broker refused connection: {refused:?}"
        ))),
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    pending: Arc<Pending>,
    stopping: Arc<AtomicBool>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = connack_result(ack.code);
                match &result {
                    Ok(()) => tracing::info!("connection established"),
                    Err(e) => tracing::warn!("{}", e),
                }
                pending.resolve_connected(result);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                if let Some(tx) = Pending::pop_front(&pending.subscribes) {
                    let _ = tx.send(if granted {
                        Ok(())
                    } else {
                        Err(TransportError::SubscribeRefused)
                    });
                }
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => {
                if let Some(tx) = Pending::pop_front(&pending.publishes) {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(topic = %publish.topic, bytes = publish.payload.len(), "message received");
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if inbound.send(message).is_err() {
                    tracing::debug!("inbound receiver dropped");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                tracing::warn!("connection error: {}", e);
                pending.fail_in_flight(&TransportError::Connection(e.to_string()));
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    pending.fail_in_flight(&TransportError::Closed);
    tracing::info!("client stopped");
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<(), TransportError> {
        let eventloop = self
            .eventloop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Connection("already started".to_string()))?;

        let (tx, rx) = oneshot::channel();
        *self
            .pending
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let handle = tokio::spawn(run_event_loop(
            eventloop,
            self.pending.clone(),
            self.stopping.clone(),
            inbound,
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubscriptionHandle, TransportError> {
        let (tx, rx) = oneshot::channel();
        Pending::push(&self.pending.subscribes, tx);

        if let Err(e) = self.client.subscribe(topic, to_mqtt_qos(qos)).await {
            Pending::pop_back(&self.pending.subscribes);
            return Err(TransportError::Request(e.to_string()));
        }

        rx.await.map_err(|_| TransportError::Closed)??;
        Ok(SubscriptionHandle {
            topic: topic.to_string(),
            qos,
        })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        let rx = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => {
                let (tx, rx) = oneshot::channel();
                Pending::push(&self.pending.publishes, tx);
                Some(rx)
            }
        };

        if let Err(e) = self
            .client
            .publish(topic, to_mqtt_qos(qos), false, payload)
            .await
        {
            if rx.is_some() {
                Pending::pop_back(&self.pending.publishes);
            }
            return Err(TransportError::Request(e.to_string()));
        }

        match rx {
            Some(rx) => rx.await.map_err(|_| TransportError::Closed)?,
            None => Ok(()),
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.stopping.store(true, Ordering::Release);
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();

        let Some(mut handle) = handle else {
            tracing::debug!("stop before connect, nothing to tear down");
            return Ok(());
        };

        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("disconnect request failed: {}", e);
            handle.abort();
            return Ok(());
        }

        if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            tracing::warn!("event loop did not stop in time, aborting");
            handle.abort();
        }
        Ok(())
    }
}
