//! Per-caller throttling for generation attempts.
//!
//! Three windows are checked in order: burst, cooldown, sustained. Cache
//! hits never reach the gate.

use std::{fmt, sync::Arc, time::Duration};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::{
    error::LibraryError,
    repos::{CoordinationError, CoordinationStore},
};

#[derive(Debug, Clone)]
pub struct RatePolicy {
    pub burst_max: u32,
    pub burst_window: Duration,
    pub cooldown: Duration,
    pub sustained_max: u32,
    pub sustained_window: Duration,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            burst_max: 5,
            burst_window: Duration::from_secs(10),
            cooldown: Duration::from_secs(3),
            sustained_max: 60,
            sustained_window: Duration::from_secs(3600),
        }
    }
}

/// Operation being throttled; each kind has its own windows per caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Narrative,
    Section,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Narrative => "narrative",
            OperationKind::Section => "section",
        }
    }
}

/// Opaque identity of whoever is asking (user id, API client, address).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which window rejected an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Burst,
    Cooldown,
    Sustained,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Burst => "burst",
            LimitKind::Cooldown => "cooldown",
            LimitKind::Sustained => "sustained",
        }
    }
}

#[derive(Clone)]
pub struct RequestGate {
    store: Arc<dyn CoordinationStore>,
    policy: RatePolicy,
}

impl RequestGate {
    pub fn new(store: Arc<dyn CoordinationStore>, policy: RatePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Admit one generation attempt or reject it with a retry delay.
    ///
    /// The cooldown is claimed while checking it, so a second overlapping
    /// request from the same caller is throttled even while the first one is
    /// still generating. It is withdrawn if the sustained check then fails.
    pub async fn authorize(
        &self,
        caller: &CallerId,
        operation: OperationKind,
    ) -> Result<(), LibraryError> {
        let burst_key = self.key(caller, operation, LimitKind::Burst);
        let burst = self
            .store
            .increment(&burst_key, 1, self.policy.burst_window)
            .await
            .map_err(|err| self.store_failure(err))?;
        if burst > i64::from(self.policy.burst_max) {
            let retry_after = self
                .retry_after(&burst_key, self.policy.burst_window)
                .await;
            return Err(self.reject(caller, operation, LimitKind::Burst, retry_after));
        }

        let cooldown_key = self.key(caller, operation, LimitKind::Cooldown);
        let token = Uuid::new_v4().to_string();
        let claimed = self
            .store
            .try_acquire(&cooldown_key, &token, self.policy.cooldown)
            .await
            .map_err(|err| self.store_failure(err))?;
        if !claimed {
            let retry_after = self.retry_after(&cooldown_key, self.policy.cooldown).await;
            return Err(self.reject(caller, operation, LimitKind::Cooldown, retry_after));
        }

        let sustained_key = self.key(caller, operation, LimitKind::Sustained);
        let sustained = match self
            .store
            .increment(&sustained_key, 1, self.policy.sustained_window)
            .await
        {
            Ok(total) => total,
            Err(err) => {
                self.withdraw_cooldown(&cooldown_key, &token).await;
                return Err(self.store_failure(err));
            }
        };
        if sustained > i64::from(self.policy.sustained_max) {
            self.withdraw_cooldown(&cooldown_key, &token).await;
            let retry_after = self
                .retry_after(&sustained_key, self.policy.sustained_window)
                .await;
            return Err(self.reject(caller, operation, LimitKind::Sustained, retry_after));
        }

        debug!(
            caller = %caller,
            operation = operation.as_str(),
            burst,
            sustained,
            "generation attempt admitted"
        );
        Ok(())
    }

    fn key(&self, caller: &CallerId, operation: OperationKind, limit: LimitKind) -> String {
        format!("gate:{}:{}:{}", operation.as_str(), limit.as_str(), caller)
    }

    async fn retry_after(&self, key: &str, fallback: Duration) -> Duration {
        match self.store.remaining_ttl(key).await {
            Ok(Some(remaining)) if !remaining.is_zero() => remaining,
            Ok(_) => fallback,
            Err(err) => {
                warn!(key, error = %err, "failed to read remaining window");
                fallback
            }
        }
    }

    async fn withdraw_cooldown(&self, key: &str, token: &str) {
        if let Err(err) = self.store.release(key, token).await {
            warn!(key, error = %err, "failed to withdraw cooldown");
        }
    }

    fn reject(
        &self,
        caller: &CallerId,
        operation: OperationKind,
        limit: LimitKind,
        retry_after: Duration,
    ) -> LibraryError {
        counter!(
            "almanac_gate_rejected_total",
            "operation" => operation.as_str(),
            "limit" => limit.as_str()
        )
        .increment(1);
        debug!(
            caller = %caller,
            operation = operation.as_str(),
            limit = limit.as_str(),
            retry_after_ms = retry_after.as_millis() as u64,
            "generation attempt throttled"
        );
        LibraryError::RateLimited { retry_after }
    }

    fn store_failure(&self, err: CoordinationError) -> LibraryError {
        warn!(error = %err, "rate gate store failed; rejecting attempt");
        LibraryError::CoordinationUnavailable {
            source: err,
            retry_after: self.policy.cooldown.max(Duration::from_secs(1)),
        }
    }
}
