//! Postgres-backed stores
//!
//! One pool serves every collection. Tables are created lazily on first
//! use.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

use super::{BudgetStore, ExpenseStore, MessageLog, QuotaStore, SubscriptionStore};
use crate::error::AppError;
use crate::models::{
    Budget, Category, DateRange, Expense, ExpenseUpdate, MessageType, Platform, QuotaRecord,
    ResponseType, Subscription, SubscriptionStatus, UserMessage,
};
use crate::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS expenses (
      id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL,
      description TEXT NOT NULL,
      amount DOUBLE PRECISION NOT NULL DEFAULT 0,
      category TEXT NOT NULL DEFAULT 'Other',
      date TIMESTAMPTZ NOT NULL,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      prompt TEXT
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_expenses_user_date
    ON expenses (user_id, date DESC, created_at ASC);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
      user_id TEXT PRIMARY KEY,
      subscription_id TEXT,
      purchase_token TEXT,
      status TEXT NOT NULL DEFAULT 'pending',
      expiry_date TIMESTAMPTZ,
      platform TEXT NOT NULL DEFAULT 'android',
      auto_renewing BOOLEAN NOT NULL DEFAULT TRUE,
      original_purchase_date TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      last_verified_date TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_quota (
      user_id TEXT NOT NULL,
      day DATE NOT NULL,
      count INTEGER NOT NULL DEFAULT 0,
      PRIMARY KEY (user_id, day)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS budgets (
      id TEXT NOT NULL,
      user_id TEXT PRIMARY KEY,
      total_budget DOUBLE PRECISION NOT NULL,
      category_budgets JSONB NOT NULL,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_messages (
      id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL,
      user_message TEXT NOT NULL,
      message_type TEXT NOT NULL,
      ai_response TEXT,
      response_type TEXT NOT NULL,
      metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_user_messages_user_time
    ON user_messages (user_id, created_at DESC);
    "#,
];

pub struct PgStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("Connected to Postgres");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = &self.pool;
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(pool).await?;
                }
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| AppError::StoreError(format!("Failed to initialize schema: {}", e)))?;
        Ok(())
    }

    fn expense_from_row(row: &PgRow) -> Result<Expense> {
        Ok(Expense {
            id: Some(row.try_get("id")?),
            user_id: row.try_get("user_id")?,
            description: row.try_get("description")?,
            amount: row.try_get("amount")?,
            category: row.try_get("category")?,
            date: row.try_get("date")?,
            created_at: row.try_get("created_at")?,
            prompt: row.try_get("prompt")?,
        })
    }

    fn quota_from_row(row: &PgRow) -> Result<QuotaRecord> {
        let count: i32 = row.try_get("count")?;
        Ok(QuotaRecord {
            user_id: row.try_get("user_id")?,
            day: row.try_get("day")?,
            count: count.max(0) as u32,
        })
    }
}

#[async_trait]
impl ExpenseStore for PgStore {
    async fn find(&self, user_id: &str, range: DateRange) -> Result<Vec<Expense>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, description, amount, category, date, created_at, prompt
            FROM expenses
            WHERE user_id = $1
              AND ($2::timestamptz IS NULL OR date >= $2)
              AND ($3::timestamptz IS NULL OR date <= $3)
            ORDER BY date DESC, created_at ASC
            "#,
        )
        .bind(user_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::expense_from_row).collect()
    }

    async fn insert(&self, expense: Expense) -> Result<String> {
        self.ensure_schema().await?;

        let id = expense
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        sqlx::query(
            r#"
            INSERT INTO expenses (id, user_id, description, amount, category, date, created_at, prompt)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&id)
        .bind(&expense.user_id)
        .bind(&expense.description)
        .bind(expense.amount)
        .bind(&expense.category)
        .bind(expense.date)
        .bind(expense.created_at)
        .bind(&expense.prompt)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn update_one(
        &self,
        user_id: &str,
        id: &str,
        update: ExpenseUpdate,
    ) -> Result<Option<Expense>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            UPDATE expenses
            SET description = $3, amount = $4, category = $5, date = $6
            WHERE user_id = $1 AND id = $2
            RETURNING id, user_id, description, amount, category, date, created_at, prompt
            "#,
        )
        .bind(user_id)
        .bind(id)
        .bind(&update.description)
        .bind(update.amount)
        .bind(&update.category)
        .bind(update.date)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::expense_from_row).transpose()
    }

    async fn delete_one(&self, user_id: &str, id: &str) -> Result<u64> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM expenses WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<Subscription>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT user_id, subscription_id, purchase_token, status, expiry_date, platform,
                   auto_renewing, original_purchase_date, last_verified_date
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let platform: String = row.try_get("platform")?;
        let expiry_date: Option<DateTime<Utc>> = row.try_get("expiry_date")?;

        Ok(Some(Subscription {
            user_id: row.try_get("user_id")?,
            subscription_id: row.try_get("subscription_id")?,
            purchase_token: row.try_get("purchase_token")?,
            status: SubscriptionStatus::from_db(&status),
            expiry_date,
            platform: Platform::from_db(&platform),
            auto_renewing: row.try_get("auto_renewing")?,
            original_purchase_date: row.try_get("original_purchase_date")?,
            last_verified_date: row.try_get("last_verified_date")?,
        }))
    }

    async fn upsert(&self, subscription: Subscription) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions
              (user_id, subscription_id, purchase_token, status, expiry_date, platform,
               auto_renewing, original_purchase_date, last_verified_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id) DO UPDATE SET
              subscription_id = EXCLUDED.subscription_id,
              purchase_token = EXCLUDED.purchase_token,
              status = EXCLUDED.status,
              expiry_date = EXCLUDED.expiry_date,
              platform = EXCLUDED.platform,
              auto_renewing = EXCLUDED.auto_renewing,
              last_verified_date = EXCLUDED.last_verified_date
            "#,
        )
        .bind(&subscription.user_id)
        .bind(&subscription.subscription_id)
        .bind(&subscription.purchase_token)
        .bind(subscription.status.as_str())
        .bind(subscription.expiry_date)
        .bind(subscription.platform.as_str())
        .bind(subscription.auto_renewing)
        .bind(subscription.original_purchase_date)
        .bind(subscription.last_verified_date)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl QuotaStore for PgStore {
    async fn find_today(&self, user_id: &str, day: NaiveDate) -> Result<Option<QuotaRecord>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT user_id, day, count FROM message_quota WHERE user_id = $1 AND day = $2",
        )
        .bind(user_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::quota_from_row).transpose()
    }

    async fn upsert_increment(&self, user_id: &str, day: NaiveDate) -> Result<QuotaRecord> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO message_quota (user_id, day, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (user_id, day) DO UPDATE SET count = message_quota.count + 1
            RETURNING user_id, day, count
            "#,
        )
        .bind(user_id)
        .bind(day)
        .fetch_one(&self.pool)
        .await?;

        Self::quota_from_row(&row)
    }

    async fn delete_for_user(&self, user_id: &str) -> Result<u64> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM message_quota WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> Result<u64> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM message_quota")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_for_day(&self, day: NaiveDate) -> Result<Vec<QuotaRecord>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT user_id, day, count FROM message_quota WHERE day = $1 ORDER BY user_id",
        )
        .bind(day)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::quota_from_row).collect()
    }
}

#[async_trait]
impl BudgetStore for PgStore {
    async fn get(&self, user_id: &str) -> Result<Option<Budget>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT id, user_id, total_budget, category_budgets, created_at, updated_at
            FROM budgets
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let Json(category_budgets): Json<BTreeMap<Category, f64>> =
            row.try_get("category_budgets")?;

        Ok(Some(Budget {
            id: Some(row.try_get("id")?),
            user_id: row.try_get("user_id")?,
            total_budget: row.try_get("total_budget")?,
            category_budgets,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save(&self, mut budget: Budget) -> Result<Budget> {
        self.ensure_schema().await?;

        let id = budget
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        budget.id = Some(id.clone());

        sqlx::query(
            r#"
            INSERT INTO budgets (id, user_id, total_budget, category_budgets, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE SET
              total_budget = EXCLUDED.total_budget,
              category_budgets = EXCLUDED.category_budgets,
              updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&id)
        .bind(&budget.user_id)
        .bind(budget.total_budget)
        .bind(Json(&budget.category_budgets))
        .bind(budget.created_at)
        .bind(budget.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(budget)
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM budgets WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MessageLog for PgStore {
    async fn append(&self, message: UserMessage) -> Result<String> {
        self.ensure_schema().await?;

        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO user_messages
              (id, user_id, user_message, message_type, ai_response, response_type, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&id)
        .bind(&message.user_id)
        .bind(&message.user_message)
        .bind(message.message_type.as_str())
        .bind(&message.ai_response)
        .bind(message.response_type.as_str())
        .bind(Json(&message.metadata))
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn list(
        &self,
        user_id: &str,
        limit: usize,
        range: DateRange,
    ) -> Result<Vec<UserMessage>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, user_message, message_type, ai_response, response_type, metadata, created_at
            FROM user_messages
            WHERE user_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at <= $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(range.start)
        .bind(range.end)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<UserMessage> {
                let message_type: String = row.try_get("message_type")?;
                let response_type: String = row.try_get("response_type")?;
                let Json(metadata): Json<serde_json::Value> = row.try_get("metadata")?;
                Ok(UserMessage {
                    id: Some(row.try_get("id")?),
                    user_id: row.try_get("user_id")?,
                    user_message: row.try_get("user_message")?,
                    message_type: MessageType::from_db(&message_type),
                    ai_response: row.try_get("ai_response")?,
                    response_type: ResponseType::from_db(&response_type),
                    created_at: row.try_get("created_at")?,
                    metadata,
                })
            })
            .collect()
    }
}
