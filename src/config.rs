//! Runtime configuration read from the environment

use std::env;
use tracing::warn;

use crate::error::AppError;
use crate::Result;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash-lite";
pub const FREE_MESSAGES_PER_DAY: u32 = 5;
pub const PREMIUM_MESSAGES_PER_DAY: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiBackendKind {
    Gemini,
    Mock,
}

/// Daily AI message allowance per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub free: u32,
    pub premium: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            free: FREE_MESSAGES_PER_DAY,
            premium: PREMIUM_MESSAGES_PER_DAY,
        }
    }
}

impl QuotaLimits {
    pub fn for_tier(&self, subscribed: bool) -> u32 {
        if subscribed {
            self.premium
        } else {
            self.free
        }
    }
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    /// Cloud API bearer token; replies are only logged when absent
    pub token: Option<String>,
    pub phone_number_id: Option<String>,
    /// Checked against `hub.verify_token` when set
    pub verify_token: Option<String>,
    /// `phone=userId` pairs, comma separated
    pub user_directory: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub ai_backend: AiBackendKind,
    pub gemini_api_key: String,
    pub gemini_model: String,
    /// Postgres connection string; in-memory stores when absent
    pub database_url: Option<String>,
    pub whatsapp: WhatsAppConfig,
    /// Bearer token guarding admin endpoints; admin is disabled when absent
    pub admin_token: Option<String>,
    pub quota: QuotaLimits,
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::ConfigError(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

/// `phone=userId,phone=userId`
pub fn parse_user_directory(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (phone, user) = pair.split_once('=')?;
            let (phone, user) = (phone.trim(), user.trim());
            if phone.is_empty() || user.is_empty() {
                None
            } else {
                Some((phone.to_string(), user.to_string()))
            }
        })
        .collect()
}

impl AppConfig {
    /// Read configuration; call `dotenv::dotenv()` first to pick up `.env`
    pub fn from_env() -> Result<Self> {
        let port = match var("PORT") {
            Some(_) => parse_var("PORT", DEFAULT_PORT)?,
            None => parse_var("API_PORT", DEFAULT_PORT)?,
        };

        let gemini_api_key = var("GEMINI_API_KEY").unwrap_or_default();
        let ai_backend = match var("AI_BACKEND").map(|v| v.to_lowercase()).as_deref() {
            Some("gemini") => AiBackendKind::Gemini,
            Some("mock") => AiBackendKind::Mock,
            Some(other) => {
                return Err(AppError::ConfigError(format!(
                    "AI_BACKEND must be 'gemini' or 'mock', got '{}'",
                    other
                )))
            }
            None if gemini_api_key.is_empty() => AiBackendKind::Mock,
            None => AiBackendKind::Gemini,
        };

        if ai_backend == AiBackendKind::Gemini && gemini_api_key.is_empty() {
            warn!("AI_BACKEND=gemini but GEMINI_API_KEY is not set; AI requests will fail");
        }

        Ok(Self {
            port,
            ai_backend,
            gemini_api_key,
            gemini_model: var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            database_url: var("DATABASE_URL").or_else(|| var("POSTGRES_URL")),
            whatsapp: WhatsAppConfig {
                token: var("WHATSAPP_TOKEN"),
                phone_number_id: var("WHATSAPP_PHONE_NUMBER_ID"),
                verify_token: var("WHATSAPP_VERIFY_TOKEN"),
                user_directory: var("WHATSAPP_USERS")
                    .map(|raw| parse_user_directory(&raw))
                    .unwrap_or_default(),
            },
            admin_token: var("ADMIN_TOKEN"),
            quota: QuotaLimits {
                free: parse_var("FREE_MESSAGES_PER_DAY", FREE_MESSAGES_PER_DAY)?,
                premium: parse_var("PREMIUM_MESSAGES_PER_DAY", PREMIUM_MESSAGES_PER_DAY)?,
            },
        })
    }

    /// In-memory, mock-backed configuration for tests and the CLI
    pub fn local() -> Self {
        Self {
            port: DEFAULT_PORT,
            ai_backend: AiBackendKind::Mock,
            gemini_api_key: String::new(),
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            database_url: None,
            whatsapp: WhatsAppConfig {
                token: None,
                phone_number_id: None,
                verify_token: None,
                user_directory: Vec::new(),
            },
            admin_token: None,
            quota: QuotaLimits::default(),
        }
    }
}
