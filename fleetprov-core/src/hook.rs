//! Pre-provisioning decision hook.
//!
//! The service consults this hook before it registers a thing. The hook sees
//! the provisioning request context and answers `{"allowProvisioning": bool}`
//! within a hard budget; an answer that does not arrive in time is a deny.
//! The client orchestrator never calls it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The service gives the hook five seconds.
pub const HOOK_BUDGET: Duration = Duration::from_secs(5);

/// The hook's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookDecision {
    pub allow_provisioning: bool,
}

impl HookDecision {
    pub fn allow() -> Self {
        Self {
            allow_provisioning: true,
        }
    }

    pub fn deny() -> Self {
        Self {
            allow_provisioning: false,
        }
    }
}

/// Decides whether a device may be provisioned.
#[async_trait]
pub trait PreProvisioningHook: Send + Sync {
    async fn decide(&self, event: &serde_json::Value) -> HookDecision;
}

/// Allows every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PreProvisioningHook for AllowAll {
    async fn decide(&self, event: &serde_json::Value) -> HookDecision {
        tracing::debug!(%event, "pre-provisioning request");
        HookDecision::allow()
    }
}

/// Run `hook` under `budget`. Exceeding the budget is an implicit deny.
pub async fn evaluate_hook(
    hook: &dyn PreProvisioningHook,
    event: &serde_json::Value,
    budget: Duration,
) -> HookDecision {
    match tokio::time::timeout(budget, hook.decide(event)).await {
        Ok(decision) => decision,
        Err(_) => {
            tracing::warn!(budget_ms = budget.as_millis() as u64, "pre-provisioning hook timed out, denying");
            HookDecision::deny()
        }
    }
}
