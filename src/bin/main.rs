use expense_assistant::{
    agent::ExpenseOrchestrator,
    backend::build_backend,
    clock::SystemClock,
    config::AppConfig,
    models::{AiRequest, Outcome},
    quota::{limit_message, remaining_notice, GateResult, QuotaGate, QuotaLedger},
    store::Stores,
    tools::AggregationRegistry,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_USER: &str = "cli-user";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    dotenv::dotenv().ok();

    let message = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if message.trim().is_empty() {
        eprintln!("usage: expense-cli <message>");
        eprintln!("  e.g. expense-cli \"lunch 250\"");
        std::process::exit(2);
    }

    // Environment decides the backend; storage is always in-memory here
    let mut config = AppConfig::from_env()?;
    config.database_url = None;

    let stores = Stores::in_memory();
    let clock = Arc::new(SystemClock);
    let ledger = Arc::new(QuotaLedger::new(
        stores.quotas.clone(),
        stores.subscriptions.clone(),
        clock.clone(),
        config.quota,
    ));
    let orchestrator = Arc::new(ExpenseOrchestrator::new(
        build_backend(&config)?,
        Arc::new(AggregationRegistry::new(stores.expenses.clone())),
        clock.clone(),
    ));
    let gate = QuotaGate::new(
        ledger.clone(),
        orchestrator,
        stores.expenses.clone(),
        stores.messages.clone(),
        clock,
    );

    info!(message = %message, "Running pipeline");

    match gate.handle(AiRequest::new(DEMO_USER, message)).await? {
        GateResult::QuotaExceeded(status) => {
            println!("{}", limit_message(&status, ledger.limits()));
        }
        GateResult::Completed { outcome, quota } => {
            match outcome {
                Outcome::Expense(expense) => {
                    println!("\n=== EXPENSE ===");
                    println!("{}", serde_json::to_string_pretty(&expense)?);
                }
                Outcome::AskReply(reply) => {
                    println!("\n=== ANSWER ===");
                    println!("{}", reply);
                }
                Outcome::ErrorMessage(message) => {
                    println!("\n=== ERROR ===");
                    println!("{}", message);
                }
            }
            println!("\n{}", remaining_notice(&quota, ledger.limits()));
        }
    }

    Ok(())
}
