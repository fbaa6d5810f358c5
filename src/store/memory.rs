//! In-memory store implementations
//!
//! Used for tests and local runs without `DATABASE_URL`. Each store is an
//! explicit value; nothing here is global.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{sort_expenses, BudgetStore, ExpenseStore, MessageLog, QuotaStore, SubscriptionStore};
use crate::models::{
    Budget, DateRange, Expense, ExpenseUpdate, QuotaRecord, Subscription, UserMessage,
};
use crate::Result;

#[derive(Default, Clone)]
pub struct InMemoryExpenseStore {
    expenses: Arc<RwLock<Vec<Expense>>>,
}

impl InMemoryExpenseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExpenseStore for InMemoryExpenseStore {
    async fn find(&self, user_id: &str, range: DateRange) -> Result<Vec<Expense>> {
        let expenses = self.expenses.read().await;
        let mut matched: Vec<Expense> = expenses
            .iter()
            .filter(|e| e.user_id == user_id && range.contains(e.date))
            .cloned()
            .collect();
        sort_expenses(&mut matched);
        Ok(matched)
    }

    async fn insert(&self, mut expense: Expense) -> Result<String> {
        let id = expense
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        expense.id = Some(id.clone());
        self.expenses.write().await.push(expense);
        Ok(id)
    }

    async fn update_one(
        &self,
        user_id: &str,
        id: &str,
        update: ExpenseUpdate,
    ) -> Result<Option<Expense>> {
        let mut expenses = self.expenses.write().await;
        let Some(existing) = expenses
            .iter_mut()
            .find(|e| e.user_id == user_id && e.id.as_deref() == Some(id))
        else {
            return Ok(None);
        };

        existing.description = update.description;
        existing.amount = update.amount;
        existing.category = update.category;
        existing.date = update.date;
        Ok(Some(existing.clone()))
    }

    async fn delete_one(&self, user_id: &str, id: &str) -> Result<u64> {
        let mut expenses = self.expenses.write().await;
        let before = expenses.len();
        expenses.retain(|e| !(e.user_id == user_id && e.id.as_deref() == Some(id)));
        Ok((before - expenses.len()) as u64)
    }
}

#[derive(Default, Clone)]
pub struct InMemorySubscriptionStore {
    subscriptions: Arc<RwLock<HashMap<String, Subscription>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().await.get(user_id).cloned())
    }

    async fn upsert(&self, subscription: Subscription) -> Result<()> {
        self.subscriptions
            .write()
            .await
            .insert(subscription.user_id.clone(), subscription);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryQuotaStore {
    records: Arc<RwLock<HashMap<(String, NaiveDate), u32>>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn find_today(&self, user_id: &str, day: NaiveDate) -> Result<Option<QuotaRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(&(user_id.to_string(), day))
            .map(|count| QuotaRecord {
                user_id: user_id.to_string(),
                day,
                count: *count,
            }))
    }

    async fn upsert_increment(&self, user_id: &str, day: NaiveDate) -> Result<QuotaRecord> {
        let mut records = self.records.write().await;
        let count = records.entry((user_id.to_string(), day)).or_insert(0);
        *count += 1;
        Ok(QuotaRecord {
            user_id: user_id.to_string(),
            day,
            count: *count,
        })
    }

    async fn delete_for_user(&self, user_id: &str) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|(uid, _), _| uid != user_id);
        Ok((before - records.len()) as u64)
    }

    async fn delete_all(&self) -> Result<u64> {
        let mut records = self.records.write().await;
        let removed = records.len() as u64;
        records.clear();
        Ok(removed)
    }

    async fn list_for_day(&self, day: NaiveDate) -> Result<Vec<QuotaRecord>> {
        let records = self.records.read().await;
        let mut listed: Vec<QuotaRecord> = records
            .iter()
            .filter(|((_, d), _)| *d == day)
            .map(|((uid, d), count)| QuotaRecord {
                user_id: uid.clone(),
                day: *d,
                count: *count,
            })
            .collect();
        listed.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(listed)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryBudgetStore {
    budgets: Arc<RwLock<HashMap<String, Budget>>>,
}

impl InMemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BudgetStore for InMemoryBudgetStore {
    async fn get(&self, user_id: &str) -> Result<Option<Budget>> {
        Ok(self.budgets.read().await.get(user_id).cloned())
    }

    async fn save(&self, mut budget: Budget) -> Result<Budget> {
        if budget.id.is_none() {
            budget.id = Some(Uuid::new_v4().to_string());
        }
        self.budgets
            .write()
            .await
            .insert(budget.user_id.clone(), budget.clone());
        Ok(budget)
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        Ok(self.budgets.write().await.remove(user_id).is_some())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryMessageLog {
    messages: Arc<RwLock<Vec<UserMessage>>>,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageLog for InMemoryMessageLog {
    async fn append(&self, mut message: UserMessage) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        message.id = Some(id.clone());
        self.messages.write().await.push(message);
        Ok(id)
    }

    async fn list(
        &self,
        user_id: &str,
        limit: usize,
        range: DateRange,
    ) -> Result<Vec<UserMessage>> {
        let messages = self.messages.read().await;
        let mut listed: Vec<UserMessage> = messages
            .iter()
            .filter(|m| m.user_id == user_id && range.contains(m.created_at))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listed.truncate(limit);
        Ok(listed)
    }
}
