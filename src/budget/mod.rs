//! Monthly budgets and budget-vs-actual summaries

use chrono::Datelike;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::{end_of_day, month_bounds, start_of_day, Clock};
use crate::error::AppError;
use crate::models::{Budget, Category, DateRange};
use crate::store::{BudgetStore, ExpenseStore};
use crate::Result;

/// A budget as shown to the caller; defaults when none is saved yet
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetView {
    pub budget: Budget,
    pub categories: Vec<&'static str>,
    pub budget_exists: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryLine {
    pub category: String,
    pub budget: f64,
    pub actual: f64,
    pub remaining: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSummary {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub total_budget: f64,
    pub total_spending: f64,
    pub remaining_budget: f64,
    pub categories: Vec<CategoryLine>,
    /// Spending under literal categories outside the enumerated set
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub other_spending: BTreeMap<String, f64>,
    pub month: u32,
    pub year: i32,
    pub budget_exists: bool,
}

pub struct BudgetService {
    budgets: Arc<dyn BudgetStore>,
    expenses: Arc<dyn ExpenseStore>,
    clock: Arc<dyn Clock>,
}

fn validate_amount(amount: f64) -> Result<f64> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(amount)
    } else {
        Err(AppError::InvalidInput(format!(
            "Budget amount must be a non-negative number, got {}",
            amount
        )))
    }
}

impl BudgetService {
    pub fn new(
        budgets: Arc<dyn BudgetStore>,
        expenses: Arc<dyn ExpenseStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            budgets,
            expenses,
            clock,
        }
    }

    async fn current_or_default(&self, user_id: &str) -> Result<Budget> {
        Ok(match self.budgets.get(user_id).await? {
            Some(budget) => budget,
            None => Budget::with_defaults(user_id, self.clock.now()),
        })
    }

    pub async fn get_budget(&self, user_id: &str) -> Result<BudgetView> {
        let saved = self.budgets.get(user_id).await?;
        let budget_exists = saved.is_some();
        let budget = saved.unwrap_or_else(|| Budget::with_defaults(user_id, self.clock.now()));
        Ok(BudgetView {
            budget,
            categories: Category::names(),
            budget_exists,
        })
    }

    /// Set the total, rescaling every category proportionally
    pub async fn update_total(&self, user_id: &str, total: f64) -> Result<Budget> {
        let total = validate_amount(total)?;
        let mut budget = self.current_or_default(user_id).await?;
        budget.set_total(total, self.clock.now());
        info!(user_id = %user_id, total, "Total budget updated");
        self.budgets.save(budget).await
    }

    pub async fn update_category(&self, user_id: &str, category: &str, amount: f64) -> Result<Budget> {
        let category: Category = category.parse()?;
        let amount = validate_amount(amount)?;
        let mut budget = self.current_or_default(user_id).await?;
        budget.set_category(category, amount, self.clock.now());
        self.budgets.save(budget).await
    }

    /// Bulk update; unknown categories are skipped
    pub async fn update_categories(
        &self,
        user_id: &str,
        entries: &BTreeMap<String, f64>,
    ) -> Result<Budget> {
        let mut valid = Vec::with_capacity(entries.len());
        for (name, amount) in entries {
            match Category::parse(name) {
                Some(category) => valid.push((category, validate_amount(*amount)?)),
                None => warn!(user_id = %user_id, category = %name, "Skipping unknown budget category"),
            }
        }

        let mut budget = self.current_or_default(user_id).await?;
        budget.set_categories(valid, self.clock.now());
        self.budgets.save(budget).await
    }

    pub async fn delete(&self, user_id: &str) -> Result<bool> {
        self.budgets.delete(user_id).await
    }

    /// Budget against actual spend for one calendar month (current month by default)
    pub async fn summary(
        &self,
        user_id: &str,
        month: Option<u32>,
        year: Option<i32>,
    ) -> Result<BudgetSummary> {
        let today = self.clock.today();
        let month = month.unwrap_or_else(|| today.month());
        let year = year.unwrap_or_else(|| today.year());
        let (first, last) = month_bounds(year, month)
            .ok_or_else(|| AppError::InvalidInput(format!("Invalid month {}-{}", year, month)))?;

        let saved = self.budgets.get(user_id).await?;
        let budget_exists = saved.is_some();
        let budget = saved.unwrap_or_else(|| Budget::with_defaults(user_id, self.clock.now()));

        let expenses = self
            .expenses
            .find(user_id, DateRange::between(start_of_day(first), end_of_day(last)))
            .await?;

        let mut spending: BTreeMap<String, f64> = BTreeMap::new();
        let mut total_spending = 0.0;
        for e in &expenses {
            *spending.entry(e.category.clone()).or_insert(0.0) += e.amount;
            total_spending += e.amount;
        }

        let categories = Category::ALL
            .iter()
            .map(|c| {
                let allotted = budget.category_budget(*c);
                let actual = spending.remove(c.as_str()).unwrap_or(0.0);
                CategoryLine {
                    category: c.as_str().to_string(),
                    budget: allotted,
                    actual,
                    remaining: allotted - actual,
                }
            })
            .collect();

        Ok(BudgetSummary {
            id: budget.id.clone(),
            total_budget: budget.total_budget,
            total_spending,
            remaining_budget: budget.total_budget - total_spending,
            categories,
            other_spending: spending,
            month,
            year,
            budget_exists,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{local_to_utc, FixedClock};
    use crate::models::{default_allocations, Expense};
    use crate::store::{InMemoryBudgetStore, InMemoryExpenseStore};
    use chrono::NaiveDate;

    fn service() -> (BudgetService, Arc<InMemoryExpenseStore>) {
        let expenses = Arc::new(InMemoryExpenseStore::new());
        let service = BudgetService::new(
            Arc::new(InMemoryBudgetStore::new()),
            expenses.clone(),
            Arc::new(FixedClock::at_local(2024, 4, 15, 12, 0, 0)),
        );
        (service, expenses)
    }

    #[tokio::test]
    async fn test_default_view_when_missing() {
        let (service, _) = service();
        let view = service.get_budget("u1").await.unwrap();
        assert!(!view.budget_exists);
        assert_eq!(view.budget.total_budget, 25000.0);
        assert_eq!(view.categories.len(), 13);
    }

    #[tokio::test]
    async fn test_doubling_total_doubles_every_category() {
        let (service, _) = service();
        let defaults = default_allocations();
        let sum: f64 = defaults.values().sum();

        let budget = service.update_total("u1", sum * 2.0).await.unwrap();

        assert_eq!(budget.total_budget, sum * 2.0);
        for (category, amount) in defaults {
            assert_eq!(budget.category_budget(category), amount * 2.0);
        }
        assert!(service.get_budget("u1").await.unwrap().budget_exists);
    }

    #[tokio::test]
    async fn test_category_updates_recompute_total() {
        let (service, _) = service();
        let budget = service.update_category("u1", "food", 6000.0).await.unwrap();
        assert_eq!(budget.total_budget, 26000.0);

        assert!(matches!(
            service.update_category("u1", "Crypto", 10.0).await,
            Err(AppError::InvalidCategory(_))
        ));
        assert!(matches!(
            service.update_total("u1", -5.0).await,
            Err(AppError::InvalidInput(_))
        ));

        let bulk = BTreeMap::from([
            ("Rent".to_string(), 10000.0),
            ("Gadgets".to_string(), 999.0),
        ]);
        let budget = service.update_categories("u1", &bulk).await.unwrap();
        assert_eq!(budget.category_budget(Category::Rent), 10000.0);
        assert_eq!(budget.total_budget, 28500.0);
    }

    #[tokio::test]
    async fn test_summary_compares_budget_and_actual() {
        let (service, expenses) = service();
        let at = |m, d| {
            local_to_utc(NaiveDate::from_ymd_opt(2024, m, d).unwrap().and_hms_opt(20, 0, 0).unwrap())
        };
        for (desc, amount, category, date) in [
            ("Groceries run", 1200.0, "Groceries", at(4, 2)),
            ("Lunch", 300.0, "Food", at(4, 30)),
            ("Gift", 500.0, "Gifts", at(4, 10)),
            ("March lunch", 999.0, "Food", at(3, 31)),
        ] {
            expenses
                .insert(Expense::new("u1", Some(desc), Some(amount), Some(category), date, date))
                .await
                .unwrap();
        }

        let summary = service.summary("u1", None, None).await.unwrap();

        assert_eq!((summary.month, summary.year), (4, 2024));
        assert!(!summary.budget_exists);
        assert_eq!(summary.total_spending, 2000.0);
        assert_eq!(summary.remaining_budget, 25000.0 - 2000.0);
        let food = summary.categories.iter().find(|l| l.category == "Food").unwrap();
        assert_eq!(food.actual, 300.0);
        assert_eq!(food.remaining, 4700.0);
        assert_eq!(summary.other_spending.get("Gifts"), Some(&500.0));

        let march = service.summary("u1", Some(3), Some(2024)).await.unwrap();
        assert_eq!(march.total_spending, 999.0);
        assert!(service.summary("u1", Some(13), None).await.is_err());
    }
}
