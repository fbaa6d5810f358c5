//! Quota gate in front of the orchestrator
//!
//! CHECK → PROCESS → INCREMENT → PERSIST → LOG
//!
//! Every accepted request consumes exactly one unit regardless of outcome.
//! Nothing is rolled back when a later step fails.

use std::sync::Arc;
use tracing::{info, warn};

use super::QuotaLedger;
use crate::agent::ExpenseOrchestrator;
use crate::clock::Clock;
use crate::models::{AiRequest, Outcome, QuotaStatus, UserMessage};
use crate::store::{ExpenseStore, MessageLog};
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum GateResult {
    /// Rejected before the orchestrator ran
    QuotaExceeded(QuotaStatus),
    /// Orchestrator outcome plus the post-increment allowance
    Completed { outcome: Outcome, quota: QuotaStatus },
}

pub struct QuotaGate {
    ledger: Arc<QuotaLedger>,
    orchestrator: Arc<ExpenseOrchestrator>,
    expenses: Arc<dyn ExpenseStore>,
    messages: Arc<dyn MessageLog>,
    clock: Arc<dyn Clock>,
}

impl QuotaGate {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        orchestrator: Arc<ExpenseOrchestrator>,
        expenses: Arc<dyn ExpenseStore>,
        messages: Arc<dyn MessageLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            orchestrator,
            expenses,
            messages,
            clock,
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Run one AI request. Only expense persistence failures surface as `Err`.
    pub async fn handle(&self, request: AiRequest) -> Result<GateResult> {
        let status = self.ledger.check_quota(&request.user_id).await;
        if !status.has_quota_left {
            info!(
                user_id = %request.user_id,
                limit = status.daily_limit,
                "Daily message limit reached"
            );
            return Ok(GateResult::QuotaExceeded(status));
        }

        let mut outcome = self.orchestrator.process(&request).await;

        if !self.ledger.increment_quota(&request.user_id).await {
            warn!(user_id = %request.user_id, "Quota increment lost");
        }

        if let Outcome::Expense(expense) = &mut outcome {
            let id = self.expenses.insert(expense.clone()).await?;
            expense.id = Some(id);
        }

        let entry = UserMessage::from_outcome(
            &request.user_id,
            &request.message,
            &outcome,
            self.clock.now(),
        );
        if let Err(e) = self.messages.append(entry).await {
            warn!(user_id = %request.user_id, error = %e, "Failed to log user message");
        }

        let quota = self.ledger.check_quota(&request.user_id).await;
        Ok(GateResult::Completed { outcome, quota })
    }
}
