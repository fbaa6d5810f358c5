//! Expense extraction orchestrator
//!
//! CLASSIFY → (expense | question → DISPATCH → SUMMARIZE | error)
//!
//! Every AI-side failure becomes an `Outcome::ErrorMessage`; the
//! orchestrator itself never returns `Err`.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::CompletionBackend;
use crate::clock::{parse_date_input, Clock};
use crate::error::AppError;
use crate::models::{AiRequest, Expense, Outcome};
use crate::tools::AggregationRegistry;

const FALLBACK_ERROR: &str = "Could not process request";

// =============================
// Classification payload
// =============================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Classification {
    #[serde(default)]
    expense: Option<ExpenseCandidate>,
    #[serde(default, alias = "is_ask")]
    is_ask: Option<bool>,
    #[serde(default)]
    ask: Option<String>,
    #[serde(default)]
    error: Option<DeclaredError>,
}

#[derive(Debug, Default, Deserialize)]
struct ExpenseCandidate {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeclaredError {
    Detailed { message: Option<String> },
    Text(String),
}

impl DeclaredError {
    fn message(&self) -> Option<&str> {
        let message = match self {
            DeclaredError::Detailed { message } => message.as_deref(),
            DeclaredError::Text(text) => Some(text.as_str()),
        };
        message.map(str::trim).filter(|m| !m.is_empty())
    }
}

/// Strip markdown code fences the model sometimes wraps JSON in
fn strip_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

fn parse_classification(raw: &str) -> Option<Classification> {
    let value: Value = serde_json::from_str(strip_fences(raw)).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Numbers, or strings such as "12.50" / "₹1,200"
fn numeric_amount(value: &Value) -> Option<f64> {
    let amount = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches('₹')
            .trim_start_matches("Rs.")
            .trim_start_matches('$')
            .replace(',', "")
            .trim()
            .parse::<f64>()
            .ok(),
        _ => None,
    }?;
    amount.is_finite().then_some(amount)
}

// =============================
// Orchestrator
// =============================

/// Three-stage pipeline turning free text into an expense or an answer
pub struct ExpenseOrchestrator {
    backend: Arc<dyn CompletionBackend>,
    registry: Arc<AggregationRegistry>,
    clock: Arc<dyn Clock>,
}

impl ExpenseOrchestrator {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        registry: Arc<AggregationRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            registry,
            clock,
        }
    }

    pub async fn process(&self, request: &AiRequest) -> Outcome {
        info!(
            user_id = %request.user_id,
            backend = self.backend.name(),
            context_turns = request.context.len(),
            "Orchestrator: processing message"
        );

        let outcome = self.run_stages(request).await;

        info!(
            user_id = %request.user_id,
            outcome = outcome.kind(),
            "Orchestrator: finished"
        );
        outcome
    }

    async fn run_stages(&self, request: &AiRequest) -> Outcome {
        // === CLASSIFY ===
        let raw = match self
            .backend
            .classify(&request.message, &request.context, self.clock.today())
            .await
        {
            Ok(raw) => raw,
            Err(e) => return backend_failure("classify", e),
        };

        let Some(classification) = parse_classification(&raw) else {
            warn!(raw = %raw, "Classification output is not a JSON object");
            return Outcome::ErrorMessage(raw);
        };

        if classification.is_ask.unwrap_or(false) {
            let question = classification
                .ask
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .unwrap_or(request.message.as_str());
            return self.answer(request, question).await;
        }

        if let Some(candidate) = &classification.expense {
            if let Some(amount) = candidate.amount.as_ref().and_then(numeric_amount) {
                return Outcome::Expense(self.finalize_expense(request, candidate, amount));
            }
            debug!("Expense candidate has no numeric amount");
        }

        let message = classification
            .error
            .as_ref()
            .and_then(DeclaredError::message)
            .unwrap_or(FALLBACK_ERROR);
        Outcome::error(message)
    }

    fn finalize_expense(
        &self,
        request: &AiRequest,
        candidate: &ExpenseCandidate,
        amount: f64,
    ) -> Expense {
        let now = self.clock.now();
        let date = candidate
            .date
            .as_deref()
            .and_then(parse_date_input)
            .map(|parsed| parsed.instant())
            .or(request.override_date)
            .unwrap_or(now);

        Expense::new(
            request.user_id.clone(),
            candidate.description.as_deref(),
            Some(amount),
            candidate.category.as_deref(),
            date,
            now,
        )
        .with_id(Uuid::new_v4().to_string())
        .with_prompt(request.message.clone())
    }

    async fn answer(&self, request: &AiRequest, question: &str) -> Outcome {
        // === DISPATCH ===
        let declarations = self.registry.declarations();
        let call = match self
            .backend
            .dispatch(question, &declarations, self.clock.today())
            .await
        {
            Ok(Some(call)) => call,
            Ok(None) => return Outcome::error("no function call found for ask"),
            Err(e) => return backend_failure("dispatch", e),
        };

        debug!(function = %call.name, args = %call.args, "Dispatching question");

        let raw = match self
            .registry
            .invoke(&request.user_id, &call.name, call.args)
            .await
        {
            Ok(raw) => raw,
            Err(AppError::ToolNotFound(name)) => {
                warn!(function = %name, "Model requested an unknown function");
                return Outcome::error(format!("unknown function: {}", name));
            }
            Err(e) => {
                warn!(function = %call.name, error = %e, "Aggregation failed");
                return Outcome::error(format!("function call failed: {}", e));
            }
        };

        // === SUMMARIZE ===
        match self.backend.summarize(&raw, &request.message).await {
            Ok(text) => Outcome::AskReply(text),
            Err(e) => backend_failure("summarize", e),
        }
    }
}

fn backend_failure(stage: &str, error: AppError) -> Outcome {
    warn!(stage, error = %error, "Completion backend failed");
    Outcome::error(format!("Error processing request: {}", error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::clock::{local_to_utc, FixedClock};
    use crate::models::{ContextTurn, TurnRole};
    use crate::store::{ExpenseStore, InMemoryExpenseStore};
    use crate::tools::GET_TOTAL_SPENT;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    struct Harness {
        backend: Arc<ScriptedBackend>,
        store: Arc<InMemoryExpenseStore>,
        clock: Arc<FixedClock>,
        orchestrator: ExpenseOrchestrator,
    }

    fn harness(backend: ScriptedBackend) -> Harness {
        let backend = Arc::new(backend);
        let store = Arc::new(InMemoryExpenseStore::new());
        let clock = Arc::new(FixedClock::at_local(2024, 3, 12, 18, 30, 0));
        let orchestrator = ExpenseOrchestrator::new(
            backend.clone(),
            Arc::new(AggregationRegistry::new(store.clone())),
            clock.clone(),
        );
        Harness {
            backend,
            store,
            clock,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_coffee_becomes_expense_dated_now() {
        let h = harness(ScriptedBackend::new(json!({
            "expense": { "description": "Coffee", "amount": 5, "category": "Food" },
            "isAsk": false
        })));

        let outcome = h.orchestrator.process(&AiRequest::new("u1", "coffee 5")).await;

        let Outcome::Expense(expense) = outcome else {
            panic!("expected expense, got {:?}", outcome);
        };
        assert_eq!(expense.amount, 5.0);
        assert!(expense.description.to_lowercase().contains("coffee"));
        assert_eq!(expense.category, "Food");
        assert_eq!(expense.date, h.clock.now());
        assert_eq!(expense.created_at, h.clock.now());
        assert_eq!(expense.prompt.as_deref(), Some("coffee 5"));
        assert!(expense.id.is_some());
        assert_eq!(h.backend.stages(), vec!["classify"]);
    }

    #[tokio::test]
    async fn test_food_last_month_dispatches_and_summarizes() {
        let h = harness(
            ScriptedBackend::new(json!({ "isAsk": true, "ask": "How much did I spend on food last month?" }))
                .with_call(
                    GET_TOTAL_SPENT,
                    json!({ "category": "Food", "startDate": "2024-02-01", "endDate": "2024-02-29" }),
                )
                .with_summary("You spent ₹250 on food last month."),
        );
        let feb = |d| local_to_utc(NaiveDate::from_ymd_opt(2024, 2, d).unwrap().and_hms_opt(13, 0, 0).unwrap());
        for (desc, amount, category, date) in [
            ("Lunch", 100.0, "Food", feb(3)),
            ("Dinner", 150.0, "Food", feb(29)),
            ("Cab", 80.0, "Transport", feb(10)),
            ("Snack", 40.0, "Food", h.clock.now()),
        ] {
            h.store
                .insert(Expense::new("u1", Some(desc), Some(amount), Some(category), date, date))
                .await
                .unwrap();
        }

        let outcome = h
            .orchestrator
            .process(&AiRequest::new("u1", "How much did I spend on food last month?"))
            .await;

        assert_eq!(outcome, Outcome::AskReply("You spent ₹250 on food last month.".into()));
        assert_eq!(h.backend.stages(), vec!["classify", "dispatch", "summarize"]);
        assert_eq!(h.backend.summarized_result(), Some(json!({ "total": 250.0 })));
    }

    #[tokio::test]
    async fn test_weather_question_is_rejected_after_classification() {
        let h = harness(ScriptedBackend::new(json!({
            "error": { "message": "I can only help with expense tracking" },
            "isAsk": false
        })));

        let outcome = h.orchestrator.process(&AiRequest::new("u1", "What's the weather?")).await;

        assert_eq!(outcome, Outcome::error("I can only help with expense tracking"));
        assert_eq!(h.backend.stages(), vec!["classify"]);
    }

    #[tokio::test]
    async fn test_unparseable_classification_returns_raw_text() {
        let h = harness(ScriptedBackend::raw("Sorry, I can't help with that."));
        let outcome = h.orchestrator.process(&AiRequest::new("u1", "???")).await;
        assert_eq!(outcome, Outcome::error("Sorry, I can't help with that."));
    }

    #[tokio::test]
    async fn test_fenced_classification_is_accepted() {
        let h = harness(ScriptedBackend::raw(
            "```json\n{\"expense\": {\"description\": \"Taxi\", \"amount\": \"120\", \"category\": \"transport\"}}\n```",
        ));
        let outcome = h.orchestrator.process(&AiRequest::new("u1", "taxi 120")).await;
        let Outcome::Expense(expense) = outcome else {
            panic!("expected expense");
        };
        assert_eq!(expense.amount, 120.0);
        assert_eq!(expense.category, "Transport");
    }

    #[tokio::test]
    async fn test_expense_without_amount_falls_back() {
        let h = harness(ScriptedBackend::new(json!({
            "expense": { "description": "Coffee", "amount": "some" }
        })));
        let outcome = h.orchestrator.process(&AiRequest::new("u1", "coffee")).await;
        assert_eq!(outcome, Outcome::error(FALLBACK_ERROR));
    }

    #[tokio::test]
    async fn test_date_precedence() {
        let override_date = Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap();

        let h = harness(ScriptedBackend::new(json!({
            "expense": { "description": "Books", "amount": 300 }
        })));
        let mut request = AiRequest::new("u1", "books 300");
        request.override_date = Some(override_date);
        let Outcome::Expense(expense) = h.orchestrator.process(&request).await else {
            panic!("expected expense");
        };
        assert_eq!(expense.date, override_date);

        let h = harness(ScriptedBackend::new(json!({
            "expense": { "description": "Books", "amount": 300, "date": "2024-02-20T10:00:00Z" }
        })));
        let Outcome::Expense(expense) = h.orchestrator.process(&request).await else {
            panic!("expected expense");
        };
        assert_eq!(expense.date, Utc.with_ymd_and_hms(2024, 2, 20, 10, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_empty_ask_uses_original_message() {
        let h = harness(
            ScriptedBackend::new(json!({ "isAsk": true, "ask": "  " }))
                .with_call(GET_TOTAL_SPENT, json!({}))
                .with_summary("₹0"),
        );
        let mut request = AiRequest::new("u1", "total so far?");
        request.context = vec![ContextTurn {
            role: TurnRole::User,
            content: "coffee 5".into(),
        }];
        h.orchestrator.process(&request).await;
        assert_eq!(h.backend.dispatched_question().as_deref(), Some("total so far?"));
    }

    #[tokio::test]
    async fn test_dispatch_errors_are_distinct() {
        let h = harness(ScriptedBackend::new(json!({ "isAsk": true, "ask": "q" })));
        assert_eq!(
            h.orchestrator.process(&AiRequest::new("u1", "q")).await,
            Outcome::error("no function call found for ask")
        );

        let h = harness(
            ScriptedBackend::new(json!({ "isAsk": true, "ask": "q" })).with_call("getWeather", json!({})),
        );
        assert_eq!(
            h.orchestrator.process(&AiRequest::new("u1", "q")).await,
            Outcome::error("unknown function: getWeather")
        );

        let h = harness(
            ScriptedBackend::new(json!({ "isAsk": true, "ask": "q" }))
                .with_call("getExpenses", json!({ "minAmount": "lots" })),
        );
        let Outcome::ErrorMessage(message) = h.orchestrator.process(&AiRequest::new("u1", "q")).await
        else {
            panic!("expected error");
        };
        assert!(message.starts_with("function call failed: "));
        assert_eq!(h.backend.stages(), vec!["classify", "dispatch"]);
    }

    #[tokio::test]
    async fn test_backend_failure_becomes_error_message() {
        let h = harness(ScriptedBackend::failing());
        let Outcome::ErrorMessage(message) = h.orchestrator.process(&AiRequest::new("u1", "coffee 5")).await
        else {
            panic!("expected error");
        };
        assert!(message.starts_with("Error processing request"));
    }
}
