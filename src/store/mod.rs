//! Persistence seams
//!
//! Each collection the assistant touches sits behind its own trait so the
//! pipeline can run against Postgres in production and plain in-memory
//! maps in tests and local runs.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;

use crate::models::{
    Budget, DateRange, Expense, ExpenseUpdate, QuotaRecord, Subscription, UserMessage,
};
use crate::Result;

pub mod memory;
pub mod postgres;

pub use memory::{
    InMemoryBudgetStore, InMemoryExpenseStore, InMemoryMessageLog, InMemoryQuotaStore,
    InMemorySubscriptionStore,
};
pub use postgres::PgStore;

/// Expense collection
#[async_trait]
pub trait ExpenseStore: Send + Sync {
    /// One user's expenses inside `range`, newest date first
    async fn find(&self, user_id: &str, range: DateRange) -> Result<Vec<Expense>>;

    /// Persist an expense and return its id
    async fn insert(&self, expense: Expense) -> Result<String>;

    async fn update_one(
        &self,
        user_id: &str,
        id: &str,
        update: ExpenseUpdate,
    ) -> Result<Option<Expense>>;

    /// Number of removed records (0 or 1)
    async fn delete_one(&self, user_id: &str, id: &str) -> Result<u64>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<Subscription>>;
    async fn upsert(&self, subscription: Subscription) -> Result<()>;
}

/// Daily AI usage counters, keyed by (user, reference-timezone day)
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn find_today(&self, user_id: &str, day: NaiveDate) -> Result<Option<QuotaRecord>>;

    /// Create the day's record at 1 or bump it by one
    async fn upsert_increment(&self, user_id: &str, day: NaiveDate) -> Result<QuotaRecord>;

    async fn delete_for_user(&self, user_id: &str) -> Result<u64>;
    async fn delete_all(&self) -> Result<u64>;
    async fn list_for_day(&self, day: NaiveDate) -> Result<Vec<QuotaRecord>>;
}

#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<Budget>>;

    /// Insert or replace the user's budget, assigning an id on first save
    async fn save(&self, budget: Budget) -> Result<Budget>;

    async fn delete(&self, user_id: &str) -> Result<bool>;
}

/// Append-only conversation history
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(&self, message: UserMessage) -> Result<String>;

    /// Newest first, at most `limit` entries
    async fn list(&self, user_id: &str, limit: usize, range: DateRange)
        -> Result<Vec<UserMessage>>;
}

/// Store listing order: date descending, then creation time ascending
pub fn sort_expenses(expenses: &mut [Expense]) {
    expenses.sort_by(|a, b| {
        b.date
            .cmp(&a.date)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// Every collection the services need
#[derive(Clone)]
pub struct Stores {
    pub expenses: Arc<dyn ExpenseStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub quotas: Arc<dyn QuotaStore>,
    pub budgets: Arc<dyn BudgetStore>,
    pub messages: Arc<dyn MessageLog>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            expenses: Arc::new(InMemoryExpenseStore::new()),
            subscriptions: Arc::new(InMemorySubscriptionStore::new()),
            quotas: Arc::new(InMemoryQuotaStore::new()),
            budgets: Arc::new(InMemoryBudgetStore::new()),
            messages: Arc::new(InMemoryMessageLog::new()),
        }
    }

    /// All collections backed by one Postgres pool
    pub async fn postgres(database_url: &str) -> Result<Self> {
        let store = Arc::new(PgStore::connect(database_url).await?);
        Ok(Self {
            expenses: store.clone(),
            subscriptions: store.clone(),
            quotas: store.clone(),
            budgets: store.clone(),
            messages: store,
        })
    }
}
