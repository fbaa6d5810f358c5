//! WhatsApp Cloud API integration
//!
//! Inbound webhook payloads are unpacked into text messages, the sender
//! is resolved to an account, and the message runs through the quota
//! gate. Replies go out through a `MessageSender`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::clock::reference_offset;
use crate::error::AppError;
use crate::models::{AiRequest, Expense, Outcome};
use crate::quota::{limit_message, remaining_notice, GateResult, QuotaGate};
use crate::Result;

const GRAPH_API_URL: &str = "https://graph.facebook.com/v17.0";
pub const BUSINESS_ACCOUNT_OBJECT: &str = "whatsapp_business_account";
pub const SIGNUP_MESSAGE: &str = "Please signup before using our services";

// =============================
// Webhook payload
// =============================

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookChange {
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChangeValue {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub from: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<TextBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextBody {
    pub body: String,
}

impl WebhookPayload {
    pub fn is_business_account(&self) -> bool {
        self.object == BUSINESS_ACCOUNT_OBJECT
    }

    /// (sender, text) for every text message in the payload
    pub fn text_messages(&self) -> Vec<(String, String)> {
        self.entry
            .iter()
            .flat_map(|e| e.changes.iter())
            .flat_map(|c| c.value.messages.iter())
            .filter(|m| m.kind.as_deref().map_or(true, |k| k == "text"))
            .filter_map(|m| {
                let body = m.text.as_ref()?.body.trim();
                if body.is_empty() {
                    None
                } else {
                    Some((m.from.clone(), body.to_string()))
                }
            })
            .collect()
    }
}

// =============================
// Collaborators
// =============================

/// Outbound text channel
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_text(&self, to: &str, body: &str) -> Result<()>;
}

/// Phone number → account lookup
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_id_for_phone(&self, phone: &str) -> Result<Option<String>>;
}

fn normalize_phone(phone: &str) -> String {
    phone.trim().trim_start_matches('+').to_string()
}

/// Fixed phone → user mapping loaded from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticUserDirectory {
    users: HashMap<String, String>,
}

impl StaticUserDirectory {
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: pairs
                .into_iter()
                .map(|(phone, user)| (normalize_phone(&phone), user))
                .collect(),
        }
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn user_id_for_phone(&self, phone: &str) -> Result<Option<String>> {
        Ok(self.users.get(&normalize_phone(phone)).cloned())
    }
}

/// WhatsApp Cloud API client
pub struct WhatsAppClient {
    client: Client,
    token: String,
    phone_number_id: String,
}

impl WhatsAppClient {
    pub fn new(token: impl Into<String>, phone_number_id: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            token: token.into(),
            phone_number_id: phone_number_id.into(),
        })
    }
}

#[async_trait]
impl MessageSender for WhatsAppClient {
    async fn send_text(&self, to: &str, body: &str) -> Result<()> {
        let url = format!("{}/{}/messages", GRAPH_API_URL, self.phone_number_id);
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": body }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::MessagingError(format!(
                "WhatsApp API returned {}: {}",
                status, text
            )));
        }
        Ok(())
    }
}

/// Sender used when no WhatsApp credentials are configured
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send_text(&self, to: &str, body: &str) -> Result<()> {
        info!(to = %to, body = %body, "WhatsApp reply (not sent, no credentials)");
        Ok(())
    }
}

/// Confirmation text for an AI-created expense
pub fn expense_text(expense: &Expense) -> String {
    let date = expense
        .date
        .with_timezone(&reference_offset())
        .format("%-d/%-m/%Y");
    format!(
        "Expense Created\n\nDescription: {}\nAmount: {}\nCategory: {}\nDate: {}\n\nPlease use the app to update the expense\n",
        expense.description, expense.amount, expense.category, date
    )
}

// =============================
// Handler
// =============================

pub struct WhatsAppHandler {
    gate: Arc<QuotaGate>,
    directory: Arc<dyn UserDirectory>,
    sender: Arc<dyn MessageSender>,
}

impl WhatsAppHandler {
    pub fn new(
        gate: Arc<QuotaGate>,
        directory: Arc<dyn UserDirectory>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            gate,
            directory,
            sender,
        }
    }

    async fn reply(&self, to: &str, body: &str) {
        if let Err(e) = self.sender.send_text(to, body).await {
            warn!(to = %to, error = %e, "Failed to send WhatsApp reply");
        }
    }

    /// Process one inbound text message end to end
    pub async fn handle_message(&self, from: &str, text: &str) -> Result<()> {
        let user_id = match self.directory.user_id_for_phone(from).await {
            Ok(Some(user_id)) => user_id,
            Ok(None) => {
                info!(from = %from, "Message from unregistered number");
                self.reply(from, SIGNUP_MESSAGE).await;
                return Ok(());
            }
            Err(e) => {
                warn!(from = %from, error = %e, "User lookup failed");
                self.reply(from, SIGNUP_MESSAGE).await;
                return Ok(());
            }
        };

        let limits = self.gate.ledger().limits();
        match self.gate.handle(AiRequest::new(user_id, text)).await? {
            GateResult::QuotaExceeded(status) => {
                self.reply(from, &limit_message(&status, limits)).await;
            }
            GateResult::Completed { outcome, quota } => match outcome {
                Outcome::AskReply(reply) => self.reply(from, &reply).await,
                Outcome::ErrorMessage(message) => self.reply(from, &message).await,
                Outcome::Expense(expense) => {
                    self.reply(from, &expense_text(&expense)).await;
                    self.reply(from, &remaining_notice(&quota, limits)).await;
                }
            },
        }
        Ok(())
    }

    /// Handle a webhook delivery. Returns false when the payload is not a
    /// WhatsApp business-account event.
    pub async fn handle_webhook(&self, payload: &WebhookPayload) -> bool {
        if !payload.is_business_account() {
            warn!(object = %payload.object, "Not a WhatsApp message");
            return false;
        }

        let messages = payload.text_messages();
        if messages.is_empty() {
            info!("Webhook carried no text messages");
        }

        for (from, text) in messages {
            if let Err(e) = self.handle_message(&from, &text).await {
                error!(from = %from, error = %e, "Failed to handle WhatsApp message");
            }
        }
        true
    }
}
