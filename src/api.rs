//! REST API for the expense assistant
//!
//! Exposes expenses, the AI pipeline, budgets, quota status, message
//! history and the WhatsApp webhook over HTTP. Caller identity is taken
//! from the `x-user-id` header.

use axum::{
    extract::{FromRequestParts, Query, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::agent::ExpenseOrchestrator;
use crate::backend::CompletionBackend;
use crate::budget::BudgetService;
use crate::clock::{current_month, end_of_day, parse_date_input, start_of_day, Clock, ParsedDate};
use crate::config::{AppConfig, QuotaLimits};
use crate::error::AppError;
use crate::models::{AiRequest, ContextTurn, DateRange, Expense, ExpenseUpdate, MessageStats, Outcome, QuotaStatus};
use crate::quota::{limit_message, GateResult, QuotaGate, QuotaLedger};
use crate::store::Stores;
use crate::tools::AggregationRegistry;
use crate::whatsapp::{
    LoggingSender, MessageSender, StaticUserDirectory, WebhookPayload, WhatsAppClient,
    WhatsAppHandler,
};
use crate::Result;

pub const USER_HEADER: &str = "x-user-id";
const DEFAULT_MESSAGE_LIMIT: usize = 50;
const DEFAULT_RECENT_LIMIT: usize = 10;
const MAX_MESSAGE_LIMIT: usize = 500;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// Error Mapping
/// =============================

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::InvalidInput(m) | AppError::InvalidToolInput(m) => {
                (StatusCode::BAD_REQUEST, m.clone())
            }
            AppError::InvalidCategory(_) | AppError::Unauthorized => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone()),
            other => {
                error!(error = %other, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(json!({ "errorMessage": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

/// Caller identity from the `x-user-id` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| AuthUser(v.to_string()))
            .ok_or(AppError::Unauthorized)
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub gate: Arc<QuotaGate>,
    pub ledger: Arc<QuotaLedger>,
    pub budgets: Arc<BudgetService>,
    pub whatsapp: Arc<WhatsAppHandler>,
    pub stores: Stores,
    pub clock: Arc<dyn Clock>,
    pub admin_token: Option<String>,
    pub verify_token: Option<String>,
}

impl ApiState {
    /// Wire every service on top of the given stores and backend
    pub fn new(
        config: &AppConfig,
        stores: Stores,
        backend: Arc<dyn CompletionBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let ledger = Arc::new(QuotaLedger::new(
            stores.quotas.clone(),
            stores.subscriptions.clone(),
            clock.clone(),
            config.quota,
        ));
        let registry = Arc::new(AggregationRegistry::new(stores.expenses.clone()));
        let orchestrator = Arc::new(ExpenseOrchestrator::new(backend, registry, clock.clone()));
        let gate = Arc::new(QuotaGate::new(
            ledger.clone(),
            orchestrator,
            stores.expenses.clone(),
            stores.messages.clone(),
            clock.clone(),
        ));
        let budgets = Arc::new(BudgetService::new(
            stores.budgets.clone(),
            stores.expenses.clone(),
            clock.clone(),
        ));

        let sender: Arc<dyn MessageSender> = match (
            &config.whatsapp.token,
            &config.whatsapp.phone_number_id,
        ) {
            (Some(token), Some(phone_id)) => Arc::new(WhatsAppClient::new(token, phone_id)?),
            _ => {
                warn!("WhatsApp credentials not set; replies will only be logged");
                Arc::new(LoggingSender)
            }
        };
        let directory = Arc::new(StaticUserDirectory::new(
            config.whatsapp.user_directory.iter().cloned(),
        ));
        let whatsapp = Arc::new(WhatsAppHandler::new(gate.clone(), directory, sender));

        Ok(Self {
            gate,
            ledger,
            budgets,
            whatsapp,
            stores,
            clock,
            admin_token: config.admin_token.clone(),
            verify_token: config.whatsapp.verify_token.clone(),
        })
    }
}

/// =============================
/// Helpers
/// =============================

fn quota_block(status: &QuotaStatus, limits: QuotaLimits) -> Value {
    json!({
        "hasQuotaLeft": status.has_quota_left,
        "remainingQuota": status.reported_remaining(),
        "isPremium": status.is_subscribed,
        "dailyLimit": status.daily_limit,
        "standardLimit": limits.free,
        "premiumLimit": limits.premium,
    })
}

fn parse_date(raw: &str) -> ApiResult<ParsedDate> {
    parse_date_input(raw).ok_or_else(|| AppError::InvalidInput(format!("Invalid date: {}", raw)))
}

/// Window from optional bounds; a bare end date covers that whole day
fn date_window(from: Option<&str>, to: Option<&str>) -> ApiResult<DateRange> {
    let start = from.map(parse_date).transpose()?.map(|d| d.instant());
    let end = to
        .map(parse_date)
        .transpose()?
        .map(|d| match d {
            ParsedDate::Day(day) => end_of_day(day),
            ParsedDate::Instant(t) => t,
        });
    Ok(DateRange { start, end })
}

fn month_window(clock: &dyn Clock) -> ApiResult<DateRange> {
    let (first, last) = current_month(clock.today())
        .ok_or_else(|| AppError::InvalidInput("Invalid current month".into()))?;
    Ok(DateRange::between(start_of_day(first), end_of_day(last)))
}

fn invalid_expense() -> AppError {
    AppError::InvalidInput("Invalid Expense".into())
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Expenses
/// =============================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RangeQuery {
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ExpenseBody {
    #[serde(rename = "_id", alias = "id")]
    pub id: Option<String>,
    pub description: Option<String>,
    pub amount: Option<f64>,
    pub category: Option<String>,
    pub date: Option<String>,
}

/// Mobile clients send `{"expense": {...}}`; a bare object is also accepted
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ExpensePayload {
    Wrapped { expense: ExpenseBody },
    Flat(ExpenseBody),
}

impl ExpensePayload {
    pub fn into_body(self) -> ExpenseBody {
        match self {
            ExpensePayload::Wrapped { expense } => expense,
            ExpensePayload::Flat(body) => body,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    #[serde(alias = "_id")]
    pub id: String,
}

async fn list_expenses(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Json<Value>> {
    let month = month_window(state.clock.as_ref())?;
    let given = date_window(query.from_date.as_deref(), query.to_date.as_deref())?;
    let range = DateRange {
        start: given.start.or(month.start),
        end: given.end.or(month.end),
    };

    let expenses = state.stores.expenses.find(&user_id, range).await?;
    let quota = state.ledger.check_quota(&user_id).await;
    Ok(Json(json!({
        "expenses": expenses,
        "quota": quota_block(&quota, state.ledger.limits()),
    })))
}

async fn create_expense(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<ExpensePayload>,
) -> ApiResult<Json<Expense>> {
    let body = payload.into_body();
    let (Some(description), Some(amount), Some(category), Some(date)) =
        (body.description, body.amount, body.category, body.date)
    else {
        return Err(invalid_expense());
    };
    let date = parse_date(&date)?.instant();

    let mut expense = Expense::new(
        &user_id,
        Some(&description),
        Some(amount),
        Some(&category),
        date,
        state.clock.now(),
    );
    let id = state.stores.expenses.insert(expense.clone()).await?;
    info!(user_id = %user_id, expense_id = %id, "Expense created");
    expense.id = Some(id);
    Ok(Json(expense))
}

async fn update_expense(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<ExpensePayload>,
) -> ApiResult<Json<Expense>> {
    let body = payload.into_body();
    let (Some(id), Some(description), Some(amount), Some(category), Some(date)) =
        (body.id, body.description, body.amount, body.category, body.date)
    else {
        return Err(invalid_expense());
    };
    let date = parse_date(&date)?.instant();

    let update = ExpenseUpdate::normalized(&description, amount, &category, date);
    state
        .stores
        .expenses
        .update_one(&user_id, &id, update)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::InvalidInput("Expense Not Found".into()))
}

async fn delete_expense(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<DeleteBody>,
) -> ApiResult<Json<Value>> {
    let deleted = state.stores.expenses.delete_one(&user_id, &body.id).await?;
    Ok(Json(json!({ "deleted": deleted > 0 })))
}

/// =============================
/// AI Expense Endpoint
/// =============================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiExpenseBody {
    #[serde(default)]
    pub user_message: String,
    pub date: Option<String>,
    #[serde(default)]
    pub context: Vec<ContextTurn>,
}

async fn ai_expense(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<AiExpenseBody>,
) -> ApiResult<Response> {
    if body.user_message.trim().is_empty() {
        return Err(AppError::InvalidInput("userMessage is required".into()));
    }

    let mut request = AiRequest::new(&user_id, body.user_message);
    request.override_date = body.date.as_deref().and_then(parse_date_input).map(|d| d.instant());
    request.context = body.context;

    let limits = state.ledger.limits();
    let response = match state.gate.handle(request).await? {
        GateResult::QuotaExceeded(status) => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "errorMessage": limit_message(&status, limits),
                "quotaExceeded": true,
                "remainingQuota": status.reported_remaining(),
                "dailyLimit": status.daily_limit,
                "isPremium": status.is_subscribed,
            })),
        ),
        GateResult::Completed { outcome, quota } => match outcome {
            Outcome::AskReply(reply) => (StatusCode::OK, Json(json!({ "askReply": reply }))),
            Outcome::ErrorMessage(message) => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "errorMessage": message })))
            }
            Outcome::Expense(expense) => (
                StatusCode::OK,
                Json(json!({
                    "expense": expense,
                    "remainingQuota": quota.reported_remaining(),
                    "dailyLimit": quota.daily_limit,
                    "isPremium": quota.is_subscribed,
                })),
            ),
        },
    };
    Ok(response.into_response())
}

/// =============================
/// Subscriptions & Quota
/// =============================

async fn message_quota(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
) -> Json<Value> {
    let status = state.ledger.check_quota(&user_id).await;
    Json(quota_block(&status, state.ledger.limits()))
}

async fn subscription_status(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<Value>> {
    let subscription = state.ledger.subscription(&user_id).await?;
    let is_subscribed = subscription
        .as_ref()
        .map_or(false, |s| s.is_entitling(state.clock.now()));
    Ok(Json(json!({
        "subscription": subscription,
        "isSubscribed": is_subscribed,
    })))
}

/// =============================
/// Budgets
/// =============================

#[derive(Debug, Deserialize, Default)]
pub struct SummaryQuery {
    pub month: Option<u32>,
    pub year: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalBody {
    pub total_budget: f64,
}

#[derive(Debug, Deserialize)]
pub struct CategoryBody {
    pub category: String,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoriesBody {
    pub category_budgets: BTreeMap<String, f64>,
}

async fn get_budget(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.budgets.get_budget(&user_id).await?))
}

async fn budget_summary(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.budgets.summary(&user_id, query.month, query.year).await?))
}

async fn update_total_budget(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<TotalBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.budgets.update_total(&user_id, body.total_budget).await?))
}

async fn update_category_budget(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<CategoryBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .budgets
            .update_category(&user_id, &body.category, body.amount)
            .await?,
    ))
}

async fn update_category_budgets(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<CategoriesBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .budgets
            .update_categories(&user_id, &body.category_budgets)
            .await?,
    ))
}

async fn delete_budget(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<Value>> {
    let deleted = state.budgets.delete(&user_id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

/// =============================
/// Message History
/// =============================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub limit: Option<usize>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

async fn list_messages(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT).min(MAX_MESSAGE_LIMIT);
    let range = date_window(query.from_date.as_deref(), query.to_date.as_deref())?;
    let messages = state.stores.messages.list(&user_id, limit, range).await?;
    let stats = MessageStats::tally(&messages);
    Ok(Json(json!({ "messages": messages, "stats": stats })))
}

async fn recent_messages(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).min(MAX_MESSAGE_LIMIT);
    let messages = state
        .stores
        .messages
        .list(&user_id, limit, DateRange::unbounded())
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

/// =============================
/// App Init
/// =============================

async fn app_init(
    State(state): State<ApiState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<Value>> {
    let expenses = state
        .stores
        .expenses
        .find(&user_id, month_window(state.clock.as_ref())?)
        .await?;
    let quota = state.ledger.check_quota(&user_id).await;
    let budget = state.budgets.get_budget(&user_id).await?;
    let summary = state.budgets.summary(&user_id, None, None).await?;

    Ok(Json(json!({
        "expenses": expenses,
        "quota": quota_block(&quota, state.ledger.limits()),
        "budget": budget,
        "budgetSummary": summary,
    })))
}

/// =============================
/// Admin
/// =============================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageQuotasBody {
    pub action: String,
    pub user_id: Option<String>,
}

fn check_admin(state: &ApiState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(AppError::Forbidden("Admin access is disabled".into()));
    };
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(AppError::Forbidden("Invalid admin token".into()))
    }
}

async fn manage_quotas(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<ManageQuotasBody>,
) -> ApiResult<Json<ApiResponse>> {
    check_admin(&state, &headers)?;

    let data = match body.action.as_str() {
        "reset" => {
            let user_id = body
                .user_id
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| AppError::InvalidInput("userId is required for reset".into()))?;
            let deleted = state.ledger.reset_user(&user_id).await?;
            info!(user_id = %user_id, deleted, "Quota reset for user");
            json!({ "userId": user_id, "deleted": deleted })
        }
        "reset_all" => {
            let deleted = state.ledger.reset_all().await?;
            info!(deleted, "All quotas reset");
            json!({ "deleted": deleted })
        }
        "get_all" => json!({ "quotas": state.ledger.usage_today().await? }),
        other => {
            return Err(AppError::InvalidInput(format!(
                "Unknown action '{}'; expected reset, reset_all or get_all",
                other
            )))
        }
    };
    Ok(Json(ApiResponse::success(data)))
}

/// =============================
/// WhatsApp Webhook
/// =============================

async fn whatsapp_verify(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<String> {
    if let Some(expected) = state.verify_token.as_deref() {
        if params.get("hub.verify_token").map(String::as_str) != Some(expected) {
            return Err(AppError::Forbidden("Verification token mismatch".into()));
        }
    }
    params
        .get("hub.challenge")
        .cloned()
        .ok_or_else(|| AppError::InvalidInput("Missing hub.challenge".into()))
}

/// Acknowledges at once; messages are processed in the background so the
/// Cloud API does not re-deliver slow webhooks
async fn whatsapp_webhook(
    State(state): State<ApiState>,
    Json(payload): Json<WebhookPayload>,
) -> (StatusCode, &'static str) {
    if !payload.is_business_account() {
        warn!(object = %payload.object, "Not a WhatsApp message");
        return (StatusCode::BAD_REQUEST, "Not a WhatsApp message");
    }

    let handler = state.whatsapp.clone();
    tokio::spawn(async move {
        handler.handle_webhook(&payload).await;
    });
    (StatusCode::OK, "OK")
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/expenses",
            get(list_expenses)
                .post(create_expense)
                .patch(update_expense)
                .delete(delete_expense),
        )
        .route("/api/ai/expense", post(ai_expense))
        .route("/api/subscriptions/message-quota", get(message_quota))
        .route("/api/subscriptions/status", get(subscription_status))
        .route("/api/budgets", get(get_budget).delete(delete_budget))
        .route("/api/budgets/summary", get(budget_summary))
        .route("/api/budgets/total", post(update_total_budget))
        .route("/api/budgets/category", post(update_category_budget))
        .route("/api/budgets/categories", post(update_category_budgets))
        .route("/api/messages", get(list_messages))
        .route("/api/messages/recent", get(recent_messages))
        .route("/api/app/init", get(app_init))
        .route("/api/admin/manage-quotas", post(manage_quotas))
        .route(
            "/api/whatsapp/expense",
            get(whatsapp_verify).post(whatsapp_webhook),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(state: ApiState, port: u16) -> Result<()> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .map_err(|e| AppError::ConfigError(format!("Cannot bind port {}: {}", port, e)))?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router)
        .await
        .map_err(|e| AppError::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::clock::FixedClock;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn state_with(config: AppConfig) -> ApiState {
        let clock = Arc::new(FixedClock::at_local(2024, 7, 4, 9, 15, 0));
        ApiState::new(&config, Stores::in_memory(), Arc::new(MockBackend), clock).unwrap()
    }

    fn router_with(config: AppConfig) -> Router {
        create_router(state_with(config))
    }

    fn router() -> Router {
        router_with(AppConfig::local())
    }

    fn request(method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&router(), request(Method::GET, "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_missing_user_header_is_rejected() {
        let (status, body) = send(&router(), request(Method::GET, "/api/expenses", None, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorMessage"], "Invalid User");
    }

    #[tokio::test]
    async fn test_ai_expense_is_persisted_and_listed() {
        let router = router();
        let (status, body) = send(
            &router,
            request(
                Method::POST,
                "/api/ai/expense",
                Some("u1"),
                Some(json!({ "userMessage": "coffee 5" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["expense"]["category"], "Food");
        assert_eq!(body["remainingQuota"], 4);
        assert_eq!(body["isPremium"], false);

        let (status, body) = send(&router, request(Method::GET, "/api/expenses", Some("u1"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["expenses"].as_array().unwrap().len(), 1);
        assert_eq!(body["quota"]["remainingQuota"], 4);
        assert_eq!(body["quota"]["premiumLimit"], 100);

        let (_, body) = send(&router, request(Method::GET, "/api/messages", Some("u1"), None)).await;
        assert_eq!(body["stats"]["expenseMessages"], 1);
    }

    #[tokio::test]
    async fn test_ai_error_and_quota_exhaustion() {
        let mut config = AppConfig::local();
        config.quota = QuotaLimits { free: 1, premium: 100 };
        let router = router_with(config);

        let (status, body) = send(
            &router,
            request(Method::POST, "/api/ai/expense", Some("u1"), Some(json!({ "userMessage": "hello there" }))),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["errorMessage"].is_string());

        let (status, body) = send(
            &router,
            request(Method::POST, "/api/ai/expense", Some("u1"), Some(json!({ "userMessage": "coffee 5" }))),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["quotaExceeded"], true);
        assert_eq!(body["dailyLimit"], 1);
        assert_eq!(
            body["errorMessage"],
            "Daily message limit (1) reached. Upgrade to premium for 100 AI messages per day."
        );
    }

    #[tokio::test]
    async fn test_manual_expense_crud() {
        let router = router();

        let (status, body) = send(
            &router,
            request(Method::POST, "/api/expenses", Some("u1"), Some(json!({ "description": "Taxi" }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorMessage"], "Invalid Expense");

        let (status, created) = send(
            &router,
            request(
                Method::POST,
                "/api/expenses",
                Some("u1"),
                Some(json!({
                    "description": "Taxi",
                    "amount": 250,
                    "category": "transport",
                    "date": "2024-07-02"
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["category"], "Transport");
        let id = created["_id"].as_str().unwrap().to_string();

        let (status, updated) = send(
            &router,
            request(
                Method::PATCH,
                "/api/expenses",
                Some("u1"),
                Some(json!({
                    "_id": id,
                    "description": "Airport taxi",
                    "amount": 900,
                    "category": "Travel",
                    "date": "2024-07-02"
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["amount"], 900.0);

        let (status, body) = send(
            &router,
            request(
                Method::PATCH,
                "/api/expenses",
                Some("u2"),
                Some(json!({
                    "_id": id,
                    "description": "x",
                    "amount": 1,
                    "category": "Other",
                    "date": "2024-07-02"
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorMessage"], "Expense Not Found");

        let (_, body) = send(
            &router,
            request(Method::DELETE, "/api/expenses", Some("u1"), Some(json!({ "id": id }))),
        )
        .await;
        assert_eq!(body["deleted"], true);
    }

    #[tokio::test]
    async fn test_wrapped_expense_reads_back_through_get_expenses() {
        let state = state_with(AppConfig::local());
        let router = create_router(state.clone());

        let (status, created) = send(
            &router,
            request(
                Method::POST,
                "/api/expenses",
                Some("u1"),
                Some(json!({
                    "expense": {
                        "description": "Taxi",
                        "amount": 250,
                        "category": "transport",
                        "date": "2024-07-02"
                    }
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["category"], "Transport");

        let registry = AggregationRegistry::new(state.stores.expenses.clone());
        let found = registry
            .invoke(
                "u1",
                crate::tools::GET_EXPENSES,
                json!({ "startDate": "2024-07-01", "endDate": "2024-07-03" }),
            )
            .await
            .unwrap();
        let found = found.as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["description"], "Taxi");
        assert_eq!(found[0]["amount"], 250.0);
        assert_eq!(found[0]["category"], "Transport");
        assert_eq!(
            found[0]["date"].as_str().and_then(parse_date_input).map(|d| d.instant()),
            parse_date_input("2024-07-02").map(|d| d.instant())
        );
    }

    #[tokio::test]
    async fn test_single_bound_defaults_other_side_to_current_month() {
        let router = router();
        for (description, date) in [("June rent", "2024-06-28"), ("July lunch", "2024-07-20"), ("August trip", "2024-08-05")] {
            let (status, _) = send(
                &router,
                request(
                    Method::POST,
                    "/api/expenses",
                    Some("u1"),
                    Some(json!({
                        "description": description,
                        "amount": 100,
                        "category": "Other",
                        "date": date
                    })),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (_, body) = send(
            &router,
            request(Method::GET, "/api/expenses?fromDate=2024-06-01", Some("u1"), None),
        )
        .await;
        let names: Vec<&str> = body["expenses"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| e["description"].as_str())
            .collect();
        assert_eq!(names, vec!["July lunch", "June rent"]);

        let (_, body) = send(
            &router,
            request(Method::GET, "/api/expenses?toDate=2024-08-31", Some("u1"), None),
        )
        .await;
        let names: Vec<&str> = body["expenses"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| e["description"].as_str())
            .collect();
        assert_eq!(names, vec!["August trip", "July lunch"]);
    }

    #[tokio::test]
    async fn test_budget_routes() {
        let router = router();
        let (status, body) = send(&router, request(Method::GET, "/api/budgets", Some("u1"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["budgetExists"], false);

        let (status, body) = send(
            &router,
            request(Method::POST, "/api/budgets/total", Some("u1"), Some(json!({ "totalBudget": 50000 }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalBudget"], 50000.0);

        let (status, body) = send(
            &router,
            request(
                Method::POST,
                "/api/budgets/category",
                Some("u1"),
                Some(json!({ "category": "Crypto", "amount": 10 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["errorMessage"].as_str().unwrap().contains("Crypto"));

        let (status, body) = send(
            &router,
            request(Method::GET, "/api/budgets/summary?month=7&year=2024", Some("u1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["budgetExists"], true);
        assert_eq!(body["month"], 7);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let mut config = AppConfig::local();
        config.admin_token = Some("secret".into());
        let router = router_with(config);

        let body = json!({ "action": "get_all" });
        let (status, _) = send(
            &router,
            request(Method::POST, "/api/admin/manage-quotas", None, Some(body.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/admin/manage-quotas")
            .header("content-type", "application/json")
            .header(AUTHORIZATION, "Bearer secret")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["data"]["quotas"].is_array());
    }

    #[tokio::test]
    async fn test_whatsapp_verification_and_webhook() {
        let mut config = AppConfig::local();
        config.whatsapp.verify_token = Some("verify-me".into());
        let router = router_with(config);

        let (status, body) = send(
            &router,
            request(
                Method::GET,
                "/api/whatsapp/expense?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345",
                None,
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(12345));

        let (status, _) = send(
            &router,
            request(
                Method::GET,
                "/api/whatsapp/expense?hub.verify_token=wrong&hub.challenge=1",
                None,
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(
            &router,
            request(Method::POST, "/api/whatsapp/expense", None, Some(json!({ "object": "page" }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_acknowledges_then_processes_in_background() {
        let mut config = AppConfig::local();
        config.whatsapp.user_directory = vec![("919800000001".into(), "u1".into())];
        let state = state_with(config);
        let router = create_router(state.clone());

        let payload = json!({
            "object": "whatsapp_business_account",
            "entry": [{ "changes": [{ "value": { "messages": [
                { "from": "919800000001", "type": "text", "text": { "body": "coffee 5" } }
            ] } }] }]
        });
        let (status, body) = send(
            &router,
            request(Method::POST, "/api/whatsapp/expense", None, Some(payload)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("OK"));

        let mut stored = Vec::new();
        for _ in 0..50 {
            stored = state.stores.expenses.find("u1", DateRange::unbounded()).await.unwrap();
            if !stored.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].description, "Coffee");
    }
}
