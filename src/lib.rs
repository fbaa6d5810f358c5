//! Expense Assistant
//!
//! Backend for a personal expense tracker with an AI assistant that:
//! - Turns free-text messages into structured expenses
//! - Answers spending questions through typed aggregation functions
//! - Meters AI usage with a per-day quota tied to subscriptions
//! - Tracks monthly budgets against actual spending
//! - Serves REST and WhatsApp transports over the same pipeline
//!
//! PIPELINE:
//! CHECK QUOTA → CLASSIFY → (EXPENSE | DISPATCH → AGGREGATE → SUMMARIZE) → COUNT → PERSIST

pub mod agent;
pub mod api;
pub mod backend;
pub mod budget;
pub mod clock;
pub mod config;
pub mod error;
pub mod gemini;
pub mod models;
pub mod quota;
pub mod store;
pub mod tools;
pub mod whatsapp;

pub use error::Result;

// Re-export common types
pub use models::*;
