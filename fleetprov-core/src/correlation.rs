//! Request correlation.
//!
//! Each outstanding request owns a single-assignment response slot. Inbound
//! messages are routed into the slot by topic; the first accepted or rejected
//! delivery wins and everything after it is logged and dropped, since the
//! broker may deliver the same response more than once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::ProvisionError;
use crate::request::{ErrorResponse, Outcome, RequestKind};
use crate::topics::{RequestTopics, TopicTable};

/// Default interval between slot checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default attempt budget for certificate-creation requests.
pub const CREDENTIAL_ATTEMPTS: u32 = 10;

/// Default attempt budget for RegisterThing.
pub const REGISTER_ATTEMPTS: u32 = 20;

/// Bounded wait policy: at most `max_attempts` checks, `poll_interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl WaitPolicy {
    pub fn new(poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            poll_interval,
            max_attempts,
        }
    }

    pub fn credential() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, CREDENTIAL_ATTEMPTS)
    }

    pub fn register() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, REGISTER_ATTEMPTS)
    }

    /// Upper bound on how long a wait can take.
    pub fn budget(&self) -> Duration {
        self.poll_interval * self.max_attempts
    }
}

/// The value a response slot resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Accepted(Vec<u8>),
    Rejected(Vec<u8>),
}

impl Response {
    /// The accepted payload, or the rejection as an error.
    pub fn into_accepted(self, kind: RequestKind) -> Result<Vec<u8>, ProvisionError> {
        match self {
            Self::Accepted(payload) => Ok(payload),
            Self::Rejected(payload) => Err(ErrorResponse::into_error(kind, &payload)),
        }
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The delivery filled the response slot.
    Resolved,
    /// The slot was already filled; the delivery was dropped.
    Duplicate,
    /// No request of this kind is outstanding.
    Unregistered,
    /// The topic does not belong to any request.
    UnknownTopic,
}

/// One outstanding request.
#[derive(Debug)]
pub struct RequestCorrelation {
    kind: RequestKind,
    topics: RequestTopics,
    slot: OnceLock<Response>,
    notify: Notify,
}

impl RequestCorrelation {
    fn new(kind: RequestKind, topics: RequestTopics) -> Self {
        Self {
            kind,
            topics,
            slot: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn topics(&self) -> &RequestTopics {
        &self.topics
    }

    /// The resolved response, if any.
    pub fn response(&self) -> Option<&Response> {
        self.slot.get()
    }

    fn resolve(&self, response: Response) -> Delivery {
        if self.slot.set(response).is_ok() {
            self.notify.notify_one();
            Delivery::Resolved
        } else {
            tracing::warn!(kind = %self.kind, "dropping duplicate response");
            Delivery::Duplicate
        }
    }

    /// Wait for the response slot to resolve.
    ///
    /// Makes at most `policy.max_attempts` checks, each waiting up to
    /// `policy.poll_interval` for a notification. Returns
    /// [`ProvisionError::Timeout`] once the budget is spent and
    /// [`ProvisionError::Cancelled`] if `cancelled` completes first.
    pub async fn wait<C>(&self, policy: WaitPolicy, cancelled: C) -> Result<Response, ProvisionError>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancelled);

        for attempt in 1..=policy.max_attempts {
            if let Some(response) = self.slot.get() {
                return Ok(response.clone());
            }
            tracing::debug!(
                kind = %self.kind,
                attempt,
                max_attempts = policy.max_attempts,
                "waiting for response"
            );

            tokio::select! {
                biased;
                _ = self.notify.notified() => {}
                _ = &mut cancelled => {
                    return Err(ProvisionError::Cancelled { kind: self.kind });
                }
                _ = tokio::time::sleep(policy.poll_interval) => {}
            }
        }

        self.slot
            .get()
            .cloned()
            .ok_or(ProvisionError::Timeout {
                kind: self.kind,
                attempts: policy.max_attempts,
            })
    }
}

/// Maps request kinds to their outstanding correlations.
#[derive(Debug)]
pub struct CorrelationRegistry {
    topics: TopicTable,
    entries: Mutex<HashMap<RequestKind, Arc<RequestCorrelation>>>,
}

impl CorrelationRegistry {
    pub fn new(topics: TopicTable) -> Self {
        Self {
            topics,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn topic_table(&self) -> &TopicTable {
        &self.topics
    }

    /// Allocate a fresh correlation for `kind`, replacing any previous one.
    pub fn register(&self, kind: RequestKind) -> Arc<RequestCorrelation> {
        let correlation = Arc::new(RequestCorrelation::new(kind, self.topics.topics(kind)));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, correlation.clone());
        correlation
    }

    fn lookup(&self, kind: RequestKind) -> Option<Arc<RequestCorrelation>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    pub fn on_accepted(&self, kind: RequestKind, payload: Vec<u8>) -> Delivery {
        self.deliver(kind, Response::Accepted(payload))
    }

    pub fn on_rejected(&self, kind: RequestKind, payload: Vec<u8>) -> Delivery {
        self.deliver(kind, Response::Rejected(payload))
    }

    fn deliver(&self, kind: RequestKind, response: Response) -> Delivery {
        match self.lookup(kind) {
            Some(correlation) => correlation.resolve(response),
            None => {
                tracing::warn!(%kind, "dropping response for request that was never sent");
                Delivery::Unregistered
            }
        }
    }

    /// Route an inbound message by topic.
    pub fn route(&self, topic: &str, payload: Vec<u8>) -> Delivery {
        match self.topics.route(topic) {
            Some((kind, Outcome::Accepted)) => self.on_accepted(kind, payload),
            Some((kind, Outcome::Rejected)) => self.on_rejected(kind, payload),
            None => {
                tracing::debug!(topic, "ignoring message on unrelated topic");
                Delivery::UnknownTopic
            }
        }
    }
}
