//! Daily AI message quota ledger
//!
//! One counter per (user, reference-timezone day). Limits depend on an
//! active subscription, re-evaluated on every check.

use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::QuotaLimits;
use crate::models::{QuotaRecord, QuotaStatus, Subscription};
use crate::store::{QuotaStore, SubscriptionStore};
use crate::Result;

pub mod gate;
pub use gate::{GateResult, QuotaGate};

/// Caller-facing text for an exhausted allowance
pub fn limit_message(status: &QuotaStatus, limits: QuotaLimits) -> String {
    let suffix = if status.is_subscribed {
        format!("Your premium account allows {} AI messages per day.", limits.premium)
    } else {
        format!("Upgrade to premium for {} AI messages per day.", limits.premium)
    };
    format!("Daily message limit ({}) reached. {}", status.daily_limit, suffix)
}

/// Remaining-allowance notice sent after an AI-created expense
pub fn remaining_notice(status: &QuotaStatus, limits: QuotaLimits) -> String {
    if status.is_subscribed {
        format!(
            "You have {} AI messages left with your premium account.",
            status.reported_remaining()
        )
    } else {
        format!(
            "You have {} AI messages left today. Upgrade to premium for {} AI messages per day.",
            status.reported_remaining(), limits.premium
        )
    }
}

pub struct QuotaLedger {
    quotas: Arc<dyn QuotaStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    limits: QuotaLimits,
}

impl QuotaLedger {
    pub fn new(
        quotas: Arc<dyn QuotaStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
        limits: QuotaLimits,
    ) -> Self {
        Self {
            quotas,
            subscriptions,
            clock,
            limits,
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    pub async fn subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        self.subscriptions.find_by_user_id(user_id).await
    }

    /// Whether the user currently holds an entitling subscription
    pub async fn is_subscribed(&self, user_id: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .subscription(user_id)
            .await?
            .map_or(false, |s| s.is_entitling(now)))
    }

    async fn try_check(&self, user_id: &str) -> Result<QuotaStatus> {
        let is_subscribed = self.is_subscribed(user_id).await?;
        let daily_limit = self.limits.for_tier(is_subscribed);
        let used = self
            .quotas
            .find_today(user_id, self.clock.today())
            .await?
            .map_or(0, |r| r.count);

        let remaining_quota = daily_limit as i64 - used as i64;
        Ok(QuotaStatus {
            has_quota_left: remaining_quota > 0,
            remaining_quota,
            is_subscribed,
            daily_limit,
            error: None,
        })
    }

    /// Today's allowance. Never fails: lookup errors grant one more message.
    pub async fn check_quota(&self, user_id: &str) -> QuotaStatus {
        match self.try_check(user_id).await {
            Ok(status) => {
                debug!(
                    user_id = %user_id,
                    remaining = status.remaining_quota,
                    limit = status.daily_limit,
                    "Quota checked"
                );
                status
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Quota check failed; allowing request");
                QuotaStatus {
                    has_quota_left: true,
                    remaining_quota: 1,
                    is_subscribed: false,
                    daily_limit: self.limits.free,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Count one AI message against today. Failures are logged, not raised.
    pub async fn increment_quota(&self, user_id: &str) -> bool {
        match self.quotas.upsert_increment(user_id, self.clock.today()).await {
            Ok(record) => {
                debug!(user_id = %user_id, count = record.count, day = %record.day, "Quota incremented");
                true
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to increment quota");
                false
            }
        }
    }

    /// Drop every counter of one user
    pub async fn reset_user(&self, user_id: &str) -> Result<u64> {
        self.quotas.delete_for_user(user_id).await
    }

    pub async fn reset_all(&self) -> Result<u64> {
        self.quotas.delete_all().await
    }

    /// All counters for the current reference day
    pub async fn usage_today(&self) -> Result<Vec<QuotaRecord>> {
        self.quotas.list_for_day(self.clock.today()).await
    }
}
