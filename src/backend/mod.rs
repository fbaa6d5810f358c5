//! Completion backends
//!
//! The language model is a black box with three capabilities: classify a
//! message, pick one aggregation function for a question, and summarize a
//! raw result. One implementation is chosen from configuration.

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::{current_month, month_bounds};
use crate::config::{AiBackendKind, AppConfig};
use crate::models::{Category, ContextTurn};
use crate::tools::{
    ToolDeclaration, GET_EXPENSES, GET_EXPENSE_SUMMARY, GET_LARGEST_EXPENSE,
    GET_RECURRING_EXPENSES, GET_TOTAL_SPENT,
};
use crate::Result;

pub mod gemini;
pub use gemini::GeminiBackend;

pub use crate::gemini::FunctionCall;

/// Black-box language model used by the orchestrator
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw classification text, expected to be a JSON object
    async fn classify(&self, message: &str, context: &[ContextTurn], today: NaiveDate)
        -> Result<String>;

    /// Exactly one function call for the question, if the model produced one
    async fn dispatch(
        &self,
        question: &str,
        tools: &[ToolDeclaration],
        today: NaiveDate,
    ) -> Result<Option<FunctionCall>>;

    /// Conversational INR answer for a raw aggregation result
    async fn summarize(&self, raw: &Value, query: &str) -> Result<String>;
}

/// Backend selected by `AI_BACKEND`
pub fn build_backend(config: &AppConfig) -> Result<Arc<dyn CompletionBackend>> {
    match config.ai_backend {
        AiBackendKind::Gemini => {
            info!(model = %config.gemini_model, "Using Gemini completion backend");
            let backend = GeminiBackend::new(&config.gemini_api_key, &config.gemini_model)?;
            Ok(Arc::new(backend))
        }
        AiBackendKind::Mock => {
            warn!("Using mock completion backend");
            Ok(Arc::new(MockBackend))
        }
    }
}

// =============================
// Mock backend
// =============================

/// Deterministic keyword backend for development and offline runs
pub struct MockBackend;

const QUESTION_WORDS: &[&str] = &["how", "what", "which", "when", "show", "list", "give", "tell"];
const FINANCE_WORDS: &[&str] = &[
    "spend", "spent", "spending", "expense", "expenses", "total", "cost", "paid", "largest",
    "biggest", "recurring", "summary", "breakdown", "budget",
];

fn words(message: &str) -> Vec<String> {
    message
        .split(|c: char| !c.is_alphanumeric() && c != '.')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn detect_category(message: &str) -> Option<Category> {
    let lower = message.to_lowercase();
    if lower.contains("personal care") {
        return Some(Category::PersonalCare);
    }
    words(&lower).iter().find_map(|w| {
        Category::parse(w).or_else(|| match w.as_str() {
            "coffee" | "tea" | "lunch" | "dinner" | "breakfast" | "biryani" | "pizza" | "snack" => {
                Some(Category::Food)
            }
            "taxi" | "uber" | "cab" | "bus" | "metro" | "fuel" | "petrol" | "train" => {
                Some(Category::Transport)
            }
            "grocery" | "vegetables" | "milk" => Some(Category::Groceries),
            "movie" | "netflix" | "concert" => Some(Category::Entertainment),
            "electricity" | "internet" | "phone" | "water" => Some(Category::Utilities),
            "medicine" | "doctor" | "pharmacy" => Some(Category::Healthcare),
            _ => None,
        })
    })
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn date_window(message: &str, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let lower = message.to_lowercase();
    if lower.contains("last month") {
        let (first, _) = current_month(today)?;
        let prev = first.pred_opt()?;
        month_bounds(prev.year(), prev.month())
    } else if lower.contains("this month") {
        current_month(today)
    } else if lower.contains("yesterday") {
        let day = today - Duration::days(1);
        Some((day, day))
    } else if lower.contains("today") {
        Some((today, today))
    } else {
        None
    }
}

fn format_inr(amount: f64) -> String {
    if amount.fract() == 0.0 {
        format!("₹{:.0}", amount)
    } else {
        format!("₹{:.2}", amount)
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn classify(
        &self,
        message: &str,
        _context: &[ContextTurn],
        _today: NaiveDate,
    ) -> Result<String> {
        let tokens = words(message);
        let is_question = message.trim_end().ends_with('?')
            || tokens
                .first()
                .map_or(false, |w| QUESTION_WORDS.contains(&w.as_str()));
        let mentions_money = tokens.iter().any(|w| FINANCE_WORDS.contains(&w.as_str()));

        if is_question && mentions_money {
            return Ok(json!({ "isAsk": true, "ask": message.trim() }).to_string());
        }

        let amount = tokens.iter().find_map(|w| w.parse::<f64>().ok());
        if let Some(amount) = amount {
            let description = tokens
                .iter()
                .filter(|w| w.parse::<f64>().is_err())
                .map(|w| capitalize(w))
                .collect::<Vec<_>>()
                .join(" ");
            let category = detect_category(message).map_or("Other", |c| c.as_str());
            return Ok(json!({
                "expense": {
                    "description": description,
                    "amount": amount,
                    "category": category,
                },
                "isAsk": false
            })
            .to_string());
        }

        Ok(json!({
            "error": { "message": "I can only help with expense tracking and financial questions" },
            "isAsk": false
        })
        .to_string())
    }

    async fn dispatch(
        &self,
        question: &str,
        tools: &[ToolDeclaration],
        today: NaiveDate,
    ) -> Result<Option<FunctionCall>> {
        let lower = question.to_lowercase();
        let name = if lower.contains("largest") || lower.contains("biggest") {
            GET_LARGEST_EXPENSE
        } else if lower.contains("recurring") || lower.contains("subscription") {
            GET_RECURRING_EXPENSES
        } else if lower.contains("summary") || lower.contains("breakdown") {
            GET_EXPENSE_SUMMARY
        } else if lower.contains("list") || lower.contains("show") {
            GET_EXPENSES
        } else {
            GET_TOTAL_SPENT
        };

        if !tools.iter().any(|t| t.name == name) {
            return Ok(None);
        }

        let mut args = Map::new();
        if name == GET_EXPENSE_SUMMARY {
            let group_by = if lower.contains("month") {
                "month"
            } else if lower.contains("week") {
                "week"
            } else {
                "category"
            };
            args.insert("groupBy".into(), json!(group_by));
        } else if let Some(category) = detect_category(question) {
            args.insert("category".into(), json!(category.as_str()));
        }

        if name != GET_RECURRING_EXPENSES {
            if let Some((start, end)) = date_window(question, today) {
                args.insert("startDate".into(), json!(start.format("%Y-%m-%d").to_string()));
                args.insert("endDate".into(), json!(end.format("%Y-%m-%d").to_string()));
            }
        }

        Ok(Some(FunctionCall {
            name: name.to_string(),
            args: Value::Object(args),
        }))
    }

    async fn summarize(&self, raw: &Value, _query: &str) -> Result<String> {
        let text = match raw {
            Value::Null => "No matching expenses found.".to_string(),
            Value::Object(map) if map.contains_key("total") => {
                let total = map.get("total").and_then(Value::as_f64).unwrap_or(0.0);
                format!("You spent {} in total.", format_inr(total))
            }
            Value::Object(map) if map.contains_key("amount") => format!(
                "Your largest expense was {} at {}.",
                map.get("description").and_then(Value::as_str).unwrap_or("an expense"),
                format_inr(map.get("amount").and_then(Value::as_f64).unwrap_or(0.0))
            ),
            Value::Object(map) => {
                let lines: Vec<String> = map
                    .iter()
                    .filter_map(|(k, v)| v.as_f64().filter(|a| *a > 0.0).map(|a| (k, a)))
                    .map(|(k, a)| format!("{}: {}", k, format_inr(a)))
                    .collect();
                if lines.is_empty() {
                    "No spending recorded for that period.".to_string()
                } else {
                    format!("Here is your spending breakdown:\n{}", lines.join("\n"))
                }
            }
            Value::Array(items) => {
                let total: f64 = items
                    .iter()
                    .filter_map(|e| e.get("amount").and_then(Value::as_f64))
                    .sum();
                format!("Found {} expenses totalling {}.", items.len(), format_inr(total))
            }
            other => other.to_string(),
        };
        Ok(text)
    }
}

// =============================
// Scripted backend (tests)
// =============================
