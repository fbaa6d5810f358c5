//! Core data models for the expense assistant

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

//
// ================= Category =================
//

/// Fixed category set shared by expenses and budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Food,
    Transport,
    Rent,
    Entertainment,
    Utilities,
    Groceries,
    Shopping,
    Healthcare,
    PersonalCare,
    Misc,
    Savings,
    Insurance,
    Lent,
}

/// Category used when an expense has none
pub const DEFAULT_CATEGORY: &str = "Other";

impl Category {
    pub const ALL: [Category; 13] = [
        Category::Food,
        Category::Transport,
        Category::Rent,
        Category::Entertainment,
        Category::Utilities,
        Category::Groceries,
        Category::Shopping,
        Category::Healthcare,
        Category::PersonalCare,
        Category::Misc,
        Category::Savings,
        Category::Insurance,
        Category::Lent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Food => "Food",
            Category::Transport => "Transport",
            Category::Rent => "Rent",
            Category::Entertainment => "Entertainment",
            Category::Utilities => "Utilities",
            Category::Groceries => "Groceries",
            Category::Shopping => "Shopping",
            Category::Healthcare => "Healthcare",
            Category::PersonalCare => "Personal Care",
            Category::Misc => "Misc",
            Category::Savings => "Savings",
            Category::Insurance => "Insurance",
            Category::Lent => "Lent",
        }
    }

    /// Case-insensitive lookup
    pub fn parse(value: &str) -> Option<Self> {
        let needle = value.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(needle))
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|c| c.as_str()).collect()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Category {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::parse(s).ok_or_else(|| AppError::InvalidCategory(s.to_string()))
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Category::parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "unknown category '{}', expected one of: {}",
                raw,
                Category::names().join(", ")
            ))
        })
    }
}

/// Canonical spelling for enumerated categories, first letter upper-cased
/// otherwise, "Other" when blank.
pub fn normalize_category(raw: Option<&str>) -> String {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return DEFAULT_CATEGORY.to_string();
    }
    if let Some(category) = Category::parse(raw) {
        return category.as_str().to_string();
    }
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => DEFAULT_CATEGORY.to_string(),
    }
}

/// Amounts are non-negative; anything else collapses to 0
pub fn normalize_amount(raw: Option<f64>) -> f64 {
    match raw {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}

//
// ================= Expense =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub description: String,
    pub amount: f64,
    pub category: String,
    pub date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl Expense {
    /// Build a normalized expense
    pub fn new(
        user_id: impl Into<String>,
        description: Option<&str>,
        amount: Option<f64>,
        category: Option<&str>,
        date: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let description = description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or("Random")
            .to_string();

        Self {
            id: None,
            user_id: user_id.into(),
            description,
            amount: normalize_amount(amount),
            category: normalize_category(category),
            date,
            created_at,
            prompt: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Full replacement of an expense's editable fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpenseUpdate {
    pub description: String,
    pub amount: f64,
    pub category: String,
    pub date: DateTime<Utc>,
}

impl ExpenseUpdate {
    pub fn normalized(description: &str, amount: f64, category: &str, date: DateTime<Utc>) -> Self {
        Self {
            description: description.trim().to_string(),
            amount: normalize_amount(Some(amount)),
            category: normalize_category(Some(category)),
            date,
        }
    }
}

/// Inclusive date window; `None` bounds are open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| instant >= s) && self.end.map_or(true, |e| instant <= e)
    }
}

//
// ================= Budget =================
//

/// Default monthly allocation (INR)
pub fn default_allocations() -> BTreeMap<Category, f64> {
    use Category::*;
    BTreeMap::from([
        (Food, 5000.0),
        (Transport, 2500.0),
        (Rent, 7500.0),
        (Entertainment, 1250.0),
        (Utilities, 2000.0),
        (Groceries, 2500.0),
        (Shopping, 1250.0),
        (Healthcare, 1250.0),
        (PersonalCare, 500.0),
        (Misc, 500.0),
        (Savings, 0.0),
        (Insurance, 750.0),
        (Lent, 0.0),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub total_budget: f64,
    pub category_budgets: BTreeMap<Category, f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    /// Unsaved budget seeded with the default allocation table
    pub fn with_defaults(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let category_budgets = default_allocations();
        let total_budget = category_budgets.values().sum();
        Self {
            id: None,
            user_id: user_id.into(),
            total_budget,
            category_budgets,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn category_budget(&self, category: Category) -> f64 {
        self.category_budgets.get(&category).copied().unwrap_or(0.0)
    }

    pub fn sum_of_categories(&self) -> f64 {
        self.category_budgets.values().sum()
    }

    /// Set the total and rescale every category to keep relative allocation
    pub fn set_total(&mut self, total: f64, now: DateTime<Utc>) {
        let total = normalize_amount(Some(total));
        let current = self.sum_of_categories();
        let factor = total / if current == 0.0 { 1.0 } else { current };

        for amount in self.category_budgets.values_mut() {
            *amount = (*amount * factor).round();
        }
        self.total_budget = total;
        self.updated_at = now;
    }

    /// Set one category; the total becomes the new category sum
    pub fn set_category(&mut self, category: Category, amount: f64, now: DateTime<Utc>) {
        self.category_budgets
            .insert(category, normalize_amount(Some(amount)));
        self.total_budget = self.sum_of_categories();
        self.updated_at = now;
    }

    pub fn set_categories<I>(&mut self, entries: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = (Category, f64)>,
    {
        for (category, amount) in entries {
            self.category_budgets
                .insert(category, normalize_amount(Some(amount)));
        }
        self.total_budget = self.sum_of_categories();
        self.updated_at = now;
    }
}

//
// ================= Quota =================
//

/// One user's AI usage on one reference-timezone day
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    pub user_id: String,
    #[serde(rename = "date")]
    pub day: NaiveDate,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub has_quota_left: bool,
    pub remaining_quota: i64,
    pub is_subscribed: bool,
    pub daily_limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QuotaStatus {
    /// Remaining allowance as shown to callers; concurrent overshoot reads as 0
    pub fn reported_remaining(&self) -> i64 {
        self.remaining_quota.max(0)
    }
}

//
// ================= Subscription =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Cancelled,
    Expired,
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Unknown => "unknown",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "pending" => SubscriptionStatus::Pending,
            "active" => SubscriptionStatus::Active,
            "cancelled" | "canceled" => SubscriptionStatus::Cancelled,
            "expired" => SubscriptionStatus::Expired,
            _ => SubscriptionStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }

    pub fn from_db(value: &str) -> Self {
        if value.eq_ignore_ascii_case("ios") {
            Platform::Ios
        } else {
            Platform::Android
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub user_id: String,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub purchase_token: Option<String>,
    pub status: SubscriptionStatus,
    pub expiry_date: Option<DateTime<Utc>>,
    pub platform: Platform,
    pub auto_renewing: bool,
    pub original_purchase_date: DateTime<Utc>,
    pub last_verified_date: DateTime<Utc>,
}

impl Subscription {
    /// Active and not yet expired at `now`
    pub fn is_entitling(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && self.expiry_date.map_or(false, |expiry| expiry > now)
    }
}

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    #[serde(alias = "model", alias = "agent")]
    Assistant,
}

/// One prior exchange supplied by the caller as conversation memory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Expense,
    Question,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ResponseType {
    Expense,
    AskReply,
    ErrorMessage,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Expense => "expense",
            MessageType::Question => "question",
            MessageType::Error => "error",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "expense" => MessageType::Expense,
            "question" => MessageType::Question,
            _ => MessageType::Error,
        }
    }
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Expense => "expense",
            ResponseType::AskReply => "askReply",
            ResponseType::ErrorMessage => "errorMessage",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "expense" => ResponseType::Expense,
            "askReply" => ResponseType::AskReply,
            _ => ResponseType::ErrorMessage,
        }
    }
}

/// Append-only conversation log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub user_message: String,
    pub message_type: MessageType,
    pub ai_response: Option<String>,
    pub response_type: ResponseType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl UserMessage {
    /// Log entry matching an orchestrator outcome
    pub fn from_outcome(
        user_id: &str,
        user_message: &str,
        outcome: &Outcome,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (message_type, ai_response, response_type, metadata) = match outcome {
            Outcome::Expense(expense) => (
                MessageType::Expense,
                None,
                ResponseType::Expense,
                serde_json::json!({ "expense": expense }),
            ),
            Outcome::AskReply(reply) => (
                MessageType::Question,
                Some(reply.clone()),
                ResponseType::AskReply,
                serde_json::json!({}),
            ),
            Outcome::ErrorMessage(message) => (
                MessageType::Error,
                Some(message.clone()),
                ResponseType::ErrorMessage,
                serde_json::json!({}),
            ),
        };

        Self {
            id: None,
            user_id: user_id.to_string(),
            user_message: user_message.to_string(),
            message_type,
            ai_response,
            response_type,
            created_at,
            metadata,
        }
    }
}

/// Per-type message counts over a window
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageStats {
    pub total_messages: usize,
    pub expense_messages: usize,
    pub question_messages: usize,
    pub error_messages: usize,
}

impl MessageStats {
    pub fn tally<'a>(messages: impl IntoIterator<Item = &'a UserMessage>) -> Self {
        let mut stats = Self::default();
        for msg in messages {
            stats.total_messages += 1;
            match msg.message_type {
                MessageType::Expense => stats.expense_messages += 1,
                MessageType::Question => stats.question_messages += 1,
                MessageType::Error => stats.error_messages += 1,
            }
        }
        stats
    }
}

//
// ================= Pipeline I/O =================
//

/// One AI-assisted request as received from a transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiRequest {
    pub user_id: String,
    pub message: String,
    /// Caller-supplied date used when the model gives none
    #[serde(default)]
    pub override_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Vec<ContextTurn>,
}

impl AiRequest {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            override_date: None,
            context: Vec::new(),
        }
    }
}

/// Exactly one of expense / ask-reply / error message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Expense(Expense),
    AskReply(String),
    ErrorMessage(String),
}

impl Outcome {
    pub fn error(message: impl Into<String>) -> Self {
        Outcome::ErrorMessage(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Expense(_) => "expense",
            Outcome::AskReply(_) => "askReply",
            Outcome::ErrorMessage(_) => "errorMessage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 6, 0, 0).unwrap()
    }

    #[test]
    fn test_category_parse_and_serde() {
        assert_eq!(Category::parse("personal care"), Some(Category::PersonalCare));
        assert_eq!(Category::parse(" FOOD "), Some(Category::Food));
        assert_eq!(Category::parse("Crypto"), None);

        let json = serde_json::to_string(&Category::PersonalCare).unwrap();
        assert_eq!(json, "\"Personal Care\"");
        let back: Category = serde_json::from_str("\"groceries\"").unwrap();
        assert_eq!(back, Category::Groceries);
        assert!(serde_json::from_str::<Category>("\"Gadgets\"").is_err());
    }

    #[test]
    fn test_expense_defaults() {
        let expense = Expense::new("u1", None, None, None, ts(1), ts(1));
        assert_eq!(expense.amount, 0.0);
        assert_eq!(expense.category, "Other");
        assert_eq!(expense.description, "Random");

        let negative = Expense::new("u1", Some("refund"), Some(-20.0), Some("food"), ts(1), ts(1));
        assert_eq!(negative.amount, 0.0);
        assert_eq!(negative.category, "Food");

        let custom = Expense::new("u1", Some("tip"), Some(3.0), Some("gifts"), ts(1), ts(1));
        assert_eq!(custom.category, "Gifts");
    }

    #[test]
    fn test_expense_serializes_with_store_id() {
        let expense = Expense::new("u1", Some("Coffee"), Some(5.0), Some("Food"), ts(2), ts(2))
            .with_id("abc");
        let json = serde_json::to_value(&expense).unwrap();
        assert_eq!(json["_id"], "abc");
        assert_eq!(json["userId"], "u1");
        assert!(json.get("prompt").is_none());
    }

    #[test]
    fn test_budget_set_total_rescales() {
        let mut budget = Budget::with_defaults("u1", ts(1));
        let before = budget.clone();
        let doubled = budget.sum_of_categories() * 2.0;

        budget.set_total(doubled, ts(2));

        assert_eq!(budget.total_budget, doubled);
        for category in Category::ALL {
            assert_eq!(
                budget.category_budget(category),
                before.category_budget(category) * 2.0
            );
        }
    }

    #[test]
    fn test_budget_set_total_from_zero_sum() {
        let mut budget = Budget::with_defaults("u1", ts(1));
        budget.set_categories(Category::ALL.iter().map(|c| (*c, 0.0)), ts(1));
        budget.set_total(1000.0, ts(2));
        assert_eq!(budget.total_budget, 1000.0);
        assert_eq!(budget.sum_of_categories(), 0.0);
    }

    #[test]
    fn test_budget_set_category_recomputes_total() {
        let mut budget = Budget::with_defaults("u1", ts(1));
        let sum = budget.sum_of_categories();
        budget.set_category(Category::Food, 6000.0, ts(2));
        assert_eq!(budget.total_budget, sum + 1000.0);
        assert_eq!(budget.updated_at, ts(2));
    }

    #[test]
    fn test_subscription_entitlement() {
        let now = ts(10);
        let mut sub = Subscription {
            user_id: "u1".into(),
            subscription_id: None,
            purchase_token: None,
            status: SubscriptionStatus::Active,
            expiry_date: Some(ts(11)),
            platform: Platform::Android,
            auto_renewing: true,
            original_purchase_date: ts(1),
            last_verified_date: ts(1),
        };
        assert!(sub.is_entitling(now));

        sub.expiry_date = Some(now);
        assert!(!sub.is_entitling(now));

        sub.expiry_date = Some(ts(11));
        sub.status = SubscriptionStatus::Cancelled;
        assert!(!sub.is_entitling(now));
    }

    #[test]
    fn test_outcome_wire_shape() {
        let reply = serde_json::to_value(Outcome::AskReply("ok".into())).unwrap();
        assert_eq!(reply, serde_json::json!({ "askReply": "ok" }));
        let err = serde_json::to_value(Outcome::error("nope")).unwrap();
        assert_eq!(err, serde_json::json!({ "errorMessage": "nope" }));
    }

    #[test]
    fn test_message_stats_tally() {
        let expense = Expense::new("u1", Some("Tea"), Some(1.0), None, ts(1), ts(1));
        let messages = vec![
            UserMessage::from_outcome("u1", "tea 1", &Outcome::Expense(expense), ts(1)),
            UserMessage::from_outcome("u1", "total?", &Outcome::AskReply("₹1".into()), ts(1)),
            UserMessage::from_outcome("u1", "weather", &Outcome::error("no"), ts(1)),
            UserMessage::from_outcome("u1", "weather?", &Outcome::error("no"), ts(1)),
        ];
        let stats = MessageStats::tally(&messages);
        assert_eq!(stats.total_messages, 4);
        assert_eq!(stats.expense_messages, 1);
        assert_eq!(stats.question_messages, 1);
        assert_eq!(stats.error_messages, 2);
    }
}
