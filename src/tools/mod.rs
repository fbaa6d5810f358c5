//! Aggregation functions and their registry
//!
//! Read-only queries over one user's expense history. Each function is
//! declared to the completion backend by name with a JSON schema and
//! dispatched through the registry with serde-validated arguments.

use async_trait::async_trait;
use chrono::Datelike;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::{end_of_day, parse_date_input, reference_offset};
use crate::error::AppError;
use crate::models::{normalize_category, Category, DateRange, Expense};
use crate::store::ExpenseStore;
use crate::Result;

pub const GET_TOTAL_SPENT: &str = "getTotalSpent";
pub const GET_EXPENSES: &str = "getExpenses";
pub const GET_EXPENSE_SUMMARY: &str = "getExpenseSummary";
pub const GET_LARGEST_EXPENSE: &str = "getLargestExpense";
pub const GET_RECURRING_EXPENSES: &str = "getRecurringExpenses";

/// Schema handed to the completion backend for one function
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A single dispatchable aggregation
#[async_trait]
pub trait AggregationFunction: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> Value;
    async fn call(&self, store: &dyn ExpenseStore, user_id: &str, args: Value) -> Result<Value>;

    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

// =============================
// Arguments
// =============================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeArgs {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseFilter {
    #[serde(flatten)]
    pub range: RangeArgs,
    #[serde(default)]
    pub min_amount: Option<f64>,
    #[serde(default)]
    pub max_amount: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GroupBy {
    #[default]
    Category,
    Month,
    Week,
    /// Anything else; yields an empty summary
    Unsupported,
}

impl<'de> Deserialize<'de> for GroupBy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Null => GroupBy::Category,
            Value::String(raw) => match raw.to_lowercase().as_str() {
                "category" => GroupBy::Category,
                "month" => GroupBy::Month,
                "week" => GroupBy::Week,
                _ => GroupBy::Unsupported,
            },
            _ => GroupBy::Unsupported,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryArgs {
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

fn parse_args<T: DeserializeOwned>(name: &str, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| AppError::InvalidToolInput(format!("{}: {}", name, e)))
}

/// Inclusive window from loose date strings. A bare start date opens at
/// local midnight; the end always closes at 23:59:59.999 of its local day.
/// Unparseable bounds are dropped.
pub fn resolve_range(start: Option<&str>, end: Option<&str>) -> DateRange {
    let start = start.and_then(|raw| match parse_date_input(raw) {
        Some(parsed) => Some(parsed.instant()),
        None => {
            warn!(start_date = raw, "Ignoring unparseable start date");
            None
        }
    });
    let end = end.and_then(|raw| match parse_date_input(raw) {
        Some(parsed) => Some(end_of_day(parsed.day())),
        None => {
            warn!(end_date = raw, "Ignoring unparseable end date");
            None
        }
    });
    DateRange { start, end }
}

fn category_matches(expense: &Expense, wanted: Option<&str>) -> bool {
    match wanted.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) => expense
            .category
            .eq_ignore_ascii_case(&normalize_category(Some(c))),
        None => true,
    }
}

async fn matching(store: &dyn ExpenseStore, user_id: &str, args: &RangeArgs) -> Result<Vec<Expense>> {
    let range = resolve_range(args.start_date.as_deref(), args.end_date.as_deref());
    let expenses = store.find(user_id, range).await?;
    Ok(expenses
        .into_iter()
        .filter(|e| category_matches(e, args.category.as_deref()))
        .collect())
}

// =============================
// Typed operations
// =============================

pub async fn get_total_spent(store: &dyn ExpenseStore, user_id: &str, args: &RangeArgs) -> Result<f64> {
    let expenses = matching(store, user_id, args).await?;
    Ok(expenses.iter().map(|e| e.amount).sum())
}

pub async fn get_expenses(
    store: &dyn ExpenseStore,
    user_id: &str,
    filter: &ExpenseFilter,
) -> Result<Vec<Expense>> {
    let expenses = matching(store, user_id, &filter.range).await?;
    Ok(expenses
        .into_iter()
        .filter(|e| filter.min_amount.map_or(true, |min| e.amount >= min))
        .filter(|e| filter.max_amount.map_or(true, |max| e.amount <= max))
        .collect())
}

/// `{year}-W{n}` with n = ceil((day_of_month - day_of_week + 1) / 7),
/// Sunday = 0, in the reference timezone. Approximate bucketing.
pub fn week_label(expense: &Expense) -> String {
    let local = expense.date.with_timezone(&reference_offset());
    let dom = local.day() as i64;
    let dow = local.weekday().num_days_from_sunday() as i64;
    let week = ((dom - dow + 1) as f64 / 7.0).ceil() as i64;
    format!("{}-W{}", local.year(), week)
}

pub fn month_label(expense: &Expense) -> String {
    let local = expense.date.with_timezone(&reference_offset());
    format!("{:04}-{:02}", local.year(), local.month())
}

pub async fn get_expense_summary(
    store: &dyn ExpenseStore,
    user_id: &str,
    args: &SummaryArgs,
) -> Result<BTreeMap<String, f64>> {
    let range_args = RangeArgs {
        category: None,
        start_date: args.start_date.clone(),
        end_date: args.end_date.clone(),
    };
    let expenses = matching(store, user_id, &range_args).await?;

    let mut summary = BTreeMap::new();
    match args.group_by {
        GroupBy::Category => {
            for category in Category::ALL {
                summary.insert(category.as_str().to_string(), 0.0);
            }
            for e in &expenses {
                *summary.entry(e.category.clone()).or_insert(0.0) += e.amount;
            }
        }
        GroupBy::Month => {
            for e in &expenses {
                *summary.entry(month_label(e)).or_insert(0.0) += e.amount;
            }
        }
        GroupBy::Week => {
            for e in &expenses {
                *summary.entry(week_label(e)).or_insert(0.0) += e.amount;
            }
        }
        GroupBy::Unsupported => {}
    }
    Ok(summary)
}

/// First maximum in store order
pub async fn get_largest_expense(
    store: &dyn ExpenseStore,
    user_id: &str,
    args: &RangeArgs,
) -> Result<Option<Expense>> {
    let expenses = matching(store, user_id, args).await?;
    let mut largest: Option<Expense> = None;
    for e in expenses {
        if largest.as_ref().map_or(true, |l| e.amount > l.amount) {
            largest = Some(e);
        }
    }
    Ok(largest)
}

/// One representative per (category, description) pair seen more than once
pub async fn get_recurring_expenses(store: &dyn ExpenseStore, user_id: &str) -> Result<Vec<Expense>> {
    let expenses = store.find(user_id, DateRange::unbounded()).await?;

    let key = |e: &Expense| format!("{}|{}", e.category, e.description);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for e in &expenses {
        *counts.entry(key(e)).or_insert(0) += 1;
    }

    let mut seen = HashSet::new();
    Ok(expenses
        .into_iter()
        .filter(|e| {
            let k = key(e);
            counts.get(&k).copied().unwrap_or(0) > 1 && seen.insert(k)
        })
        .collect())
}

// =============================
// Declared functions
// =============================

fn range_properties() -> serde_json::Map<String, Value> {
    let mut props = serde_json::Map::new();
    props.insert(
        "category".into(),
        json!({
            "type": "string",
            "description": format!("Expense category, one of: {}", Category::names().join(", "))
        }),
    );
    props.insert(
        "startDate".into(),
        json!({ "type": "string", "description": "Inclusive start date, YYYY-MM-DD" }),
    );
    props.insert(
        "endDate".into(),
        json!({ "type": "string", "description": "Inclusive end date, YYYY-MM-DD" }),
    );
    props
}

struct TotalSpent;

#[async_trait]
impl AggregationFunction for TotalSpent {
    fn name(&self) -> &'static str {
        GET_TOTAL_SPENT
    }

    fn description(&self) -> &'static str {
        "Total amount spent, optionally for one category and date range"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": range_properties() })
    }

    async fn call(&self, store: &dyn ExpenseStore, user_id: &str, args: Value) -> Result<Value> {
        let args: RangeArgs = parse_args(self.name(), args)?;
        let total = get_total_spent(store, user_id, &args).await?;
        Ok(json!({ "total": total }))
    }
}

struct ListExpenses;

#[async_trait]
impl AggregationFunction for ListExpenses {
    fn name(&self) -> &'static str {
        GET_EXPENSES
    }

    fn description(&self) -> &'static str {
        "List expenses filtered by category, date range and amount bounds"
    }

    fn parameters(&self) -> Value {
        let mut props = range_properties();
        props.insert(
            "minAmount".into(),
            json!({ "type": "number", "description": "Minimum amount (inclusive)" }),
        );
        props.insert(
            "maxAmount".into(),
            json!({ "type": "number", "description": "Maximum amount (inclusive)" }),
        );
        json!({ "type": "object", "properties": props })
    }

    async fn call(&self, store: &dyn ExpenseStore, user_id: &str, args: Value) -> Result<Value> {
        let filter: ExpenseFilter = parse_args(self.name(), args)?;
        let expenses = get_expenses(store, user_id, &filter).await?;
        Ok(serde_json::to_value(expenses)?)
    }
}

struct ExpenseSummary;

#[async_trait]
impl AggregationFunction for ExpenseSummary {
    fn name(&self) -> &'static str {
        GET_EXPENSE_SUMMARY
    }

    fn description(&self) -> &'static str {
        "Total spending grouped by category, month or week"
    }

    fn parameters(&self) -> Value {
        let mut props = range_properties();
        props.remove("category");
        props.insert(
            "groupBy".into(),
            json!({ "type": "string", "enum": ["category", "month", "week"] }),
        );
        json!({ "type": "object", "properties": props, "required": ["groupBy"] })
    }

    async fn call(&self, store: &dyn ExpenseStore, user_id: &str, args: Value) -> Result<Value> {
        let args: SummaryArgs = parse_args(self.name(), args)?;
        let summary = get_expense_summary(store, user_id, &args).await?;
        Ok(serde_json::to_value(summary)?)
    }
}

struct LargestExpense;

#[async_trait]
impl AggregationFunction for LargestExpense {
    fn name(&self) -> &'static str {
        GET_LARGEST_EXPENSE
    }

    fn description(&self) -> &'static str {
        "The single largest expense, optionally for one category and date range"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": range_properties() })
    }

    async fn call(&self, store: &dyn ExpenseStore, user_id: &str, args: Value) -> Result<Value> {
        let args: RangeArgs = parse_args(self.name(), args)?;
        let largest = get_largest_expense(store, user_id, &args).await?;
        Ok(serde_json::to_value(largest)?)
    }
}

struct RecurringExpenses;

#[async_trait]
impl AggregationFunction for RecurringExpenses {
    fn name(&self) -> &'static str {
        GET_RECURRING_EXPENSES
    }

    fn description(&self) -> &'static str {
        "Expenses that repeat with the same category and description"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, store: &dyn ExpenseStore, user_id: &str, _args: Value) -> Result<Value> {
        let recurring = get_recurring_expenses(store, user_id).await?;
        Ok(serde_json::to_value(recurring)?)
    }
}

// =============================
// Registry
// =============================

/// Name → handler lookup bound to one expense store
pub struct AggregationRegistry {
    store: Arc<dyn ExpenseStore>,
    functions: HashMap<String, Arc<dyn AggregationFunction>>,
}

impl AggregationRegistry {
    /// Registry with every built-in aggregation
    pub fn new(store: Arc<dyn ExpenseStore>) -> Self {
        let mut registry = Self {
            store,
            functions: HashMap::new(),
        };
        registry.register(Arc::new(TotalSpent));
        registry.register(Arc::new(ListExpenses));
        registry.register(Arc::new(ExpenseSummary));
        registry.register(Arc::new(LargestExpense));
        registry.register(Arc::new(RecurringExpenses));
        registry
    }

    pub fn register(&mut self, function: Arc<dyn AggregationFunction>) {
        self.functions.insert(function.name().to_string(), function);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<ToolDeclaration> =
            self.functions.values().map(|f| f.declaration()).collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    /// Run a function by its declared name
    pub async fn invoke(&self, user_id: &str, name: &str, args: Value) -> Result<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| AppError::ToolNotFound(name.to_string()))?;

        debug!(function = name, %args, "Invoking aggregation");
        function.call(self.store.as_ref(), user_id, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::local_to_utc;
    use crate::store::InMemoryExpenseStore;
    use chrono::{DateTime, NaiveDate, Utc};

    fn local(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        local_to_utc(
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap(),
        )
    }

    async fn seeded(entries: &[(&str, f64, &str, DateTime<Utc>)]) -> Arc<InMemoryExpenseStore> {
        let store = Arc::new(InMemoryExpenseStore::new());
        for (desc, amount, category, date) in entries {
            store
                .insert(Expense::new("u1", Some(*desc), Some(*amount), Some(*category), *date, *date))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_category_summary_includes_every_category() {
        let store = seeded(&[
            ("Lunch", 10.0, "Food", local(2024, 1, 3, 12)),
            ("Dinner", 20.0, "food", local(2024, 1, 4, 20)),
            ("Bus", 5.0, "Transport", local(2024, 1, 5, 9)),
        ])
        .await;
        let registry = AggregationRegistry::new(store);

        let result = registry
            .invoke("u1", GET_EXPENSE_SUMMARY, json!({ "groupBy": "category" }))
            .await
            .unwrap();

        assert_eq!(result["Food"], 30.0);
        assert_eq!(result["Transport"], 5.0);
        assert_eq!(result["Rent"], 0.0);
        assert_eq!(result["Personal Care"], 0.0);
        assert_eq!(result.as_object().unwrap().len(), Category::ALL.len());
    }

    #[tokio::test]
    async fn test_summary_group_by_defaults_to_category() {
        let store = seeded(&[("Lunch", 10.0, "Food", local(2024, 1, 3, 12))]).await;
        let registry = AggregationRegistry::new(store);

        let result = registry
            .invoke("u1", GET_EXPENSE_SUMMARY, json!({}))
            .await
            .unwrap();
        assert_eq!(result["Food"], 10.0);
        assert_eq!(result.as_object().unwrap().len(), Category::ALL.len());

        let result = registry
            .invoke("u1", GET_EXPENSE_SUMMARY, json!({ "groupBy": 3 }))
            .await
            .unwrap();
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn test_summary_by_month_week_and_unknown() {
        let store = seeded(&[
            ("A", 10.0, "Food", local(2024, 1, 15, 10)),
            ("B", 4.0, "Food", local(2024, 2, 1, 10)),
        ])
        .await;

        let months = get_expense_summary(
            store.as_ref(),
            "u1",
            &SummaryArgs { group_by: GroupBy::Month, start_date: None, end_date: None },
        )
        .await
        .unwrap();
        assert_eq!(months.get("2024-01"), Some(&10.0));
        assert_eq!(months.get("2024-02"), Some(&4.0));

        let weeks = get_expense_summary(
            store.as_ref(),
            "u1",
            &SummaryArgs { group_by: GroupBy::Week, start_date: None, end_date: None },
        )
        .await
        .unwrap();
        // Jan 15 2024 is a Monday: ceil((15 - 1 + 1) / 7) = 3
        assert_eq!(weeks.get("2024-W3"), Some(&10.0));
        // Feb 1 2024 is a Thursday: ceil((1 - 4 + 1) / 7) = 0
        assert_eq!(weeks.get("2024-W0"), Some(&4.0));

        let registry = AggregationRegistry::new(store);
        let empty = registry
            .invoke("u1", GET_EXPENSE_SUMMARY, json!({ "groupBy": "year" }))
            .await
            .unwrap();
        assert_eq!(empty, json!({}));
    }

    #[tokio::test]
    async fn test_total_spent_end_date_covers_whole_day() {
        let store = seeded(&[
            ("Late snack", 7.0, "Food", local(2024, 1, 15, 23)),
            ("Next day", 9.0, "Food", local(2024, 1, 16, 0)),
            ("Cab", 3.0, "Transport", local(2024, 1, 15, 8)),
        ])
        .await;

        let food = RangeArgs {
            category: Some("food".into()),
            start_date: Some("2024-01-15".into()),
            end_date: Some("2024-01-15".into()),
        };
        assert_eq!(get_total_spent(store.as_ref(), "u1", &food).await.unwrap(), 7.0);

        let all = RangeArgs {
            category: None,
            start_date: Some("2024-01-15".into()),
            end_date: Some("2024-01-15".into()),
        };
        assert_eq!(get_total_spent(store.as_ref(), "u1", &all).await.unwrap(), 10.0);

        let none = RangeArgs {
            category: Some("Rent".into()),
            ..RangeArgs::default()
        };
        assert_eq!(get_total_spent(store.as_ref(), "u1", &none).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_unparseable_dates_are_unbounded() {
        let range = resolve_range(Some("not a date"), Some("soon"));
        assert_eq!(range, DateRange::unbounded());
    }

    #[tokio::test]
    async fn test_get_expenses_applies_amount_filters() {
        let store = seeded(&[
            ("Coffee", 5.0, "Food", local(2024, 1, 1, 9)),
            ("Groceries", 80.0, "Groceries", local(2024, 1, 2, 9)),
            ("Phone", 300.0, "Utilities", local(2024, 1, 3, 9)),
        ])
        .await;
        let registry = AggregationRegistry::new(store);

        let result = registry
            .invoke("u1", GET_EXPENSES, json!({ "minAmount": 10, "maxAmount": 100 }))
            .await
            .unwrap();
        let list = result.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["description"], "Groceries");
    }

    #[tokio::test]
    async fn test_largest_expense_empty_and_ties() {
        let empty = AggregationRegistry::new(Arc::new(InMemoryExpenseStore::new()));
        let result = empty.invoke("u1", GET_LARGEST_EXPENSE, Value::Null).await.unwrap();
        assert!(result.is_null());

        let store = seeded(&[
            ("Older", 50.0, "Food", local(2024, 1, 1, 9)),
            ("Newer", 50.0, "Food", local(2024, 1, 2, 9)),
        ])
        .await;
        let largest = get_largest_expense(store.as_ref(), "u1", &RangeArgs::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(largest.description, "Newer");
    }

    #[tokio::test]
    async fn test_recurring_expenses_deduplicated() {
        let store = seeded(&[
            ("Netflix", 499.0, "Entertainment", local(2024, 1, 1, 9)),
            ("Netflix", 499.0, "Entertainment", local(2024, 2, 1, 9)),
            ("Netflix", 499.0, "Entertainment", local(2024, 3, 1, 9)),
            ("Netflix", 199.0, "Misc", local(2024, 3, 2, 9)),
            ("Rent", 15000.0, "Rent", local(2024, 3, 3, 9)),
        ])
        .await;

        let recurring = get_recurring_expenses(store.as_ref(), "u1").await.unwrap();
        assert_eq!(recurring.len(), 1);
        assert_eq!(recurring[0].description, "Netflix");
        assert_eq!(recurring[0].category, "Entertainment");
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown_and_invalid() {
        let registry = AggregationRegistry::new(Arc::new(InMemoryExpenseStore::new()));
        assert_eq!(registry.names().len(), 5);
        assert_eq!(registry.declarations()[0].name, GET_EXPENSE_SUMMARY);

        let unknown = registry.invoke("u1", "getWeather", json!({})).await;
        assert!(matches!(unknown, Err(AppError::ToolNotFound(n)) if n == "getWeather"));

        let invalid = registry
            .invoke("u1", GET_EXPENSES, json!({ "minAmount": "lots" }))
            .await;
        assert!(matches!(invalid, Err(AppError::InvalidToolInput(_))));
    }
}
