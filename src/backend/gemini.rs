//! Gemini-backed completion backend

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use super::{CompletionBackend, FunctionCall};
use crate::gemini::{Content, FunctionDeclaration, GeminiClient};
use crate::models::{Category, ContextTurn, TurnRole};
use crate::tools::ToolDeclaration;
use crate::Result;

pub struct GeminiBackend {
    client: GeminiClient,
}

impl GeminiBackend {
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        Ok(Self {
            client: GeminiClient::new(api_key, model)?,
        })
    }

    fn classification_prompt(today: NaiveDate) -> String {
        format!(
            r#"You are an expense-tracking assistant. Read the user's message and reply with one JSON object only.

Shapes:
- Expense entry: {{"expense": {{"description": string, "amount": number, "category": string, "date": "YYYY-MM-DD"}}, "isAsk": false}}
- Question about their own spending: {{"isAsk": true, "ask": "<the question, restated clearly>"}}
- Anything else: {{"error": {{"message": "<short reason>"}}, "isAsk": false}}

Categories: {categories}. Use "Other" when none fits.
Correct obvious spelling in descriptions. Amounts are in INR. Omit "date" unless the user names one; today is {today}.

Examples:
"coffee 5" -> {{"expense": {{"description": "Coffee", "amount": 5, "category": "Food"}}, "isAsk": false}}
"how much did I spend on food?" -> {{"isAsk": true, "ask": "How much did I spend on food?"}}
"what's the weather?" -> {{"error": {{"message": "I can only help with expense tracking and financial questions"}}, "isAsk": false}}

Never call functions. Never add text outside the JSON. Never ask the user to clarify."#,
            categories = Category::names().join(", "),
            today = today.format("%Y-%m-%d"),
        )
    }

    fn dispatch_prompt(today: NaiveDate) -> String {
        format!(
            r#"You answer questions about a user's expenses by calling exactly one of the provided functions.

Today is {today} (India Standard Time). Resolve relative periods such as "last month" or "this week" to explicit startDate/endDate values in YYYY-MM-DD.
Categories: {categories}.
Leave dates out when the user asks about their spending habits in general.
ALWAYS call exactly one function. Do not reply with text."#,
            today = today.format("%Y-%m-%d"),
            categories = Category::names().join(", "),
        )
    }

    const SUMMARY_PROMPT: &'static str = r#"You turn raw expense data into a short, direct answer to the user's question.

Start with the answer itself, then any notable detail. Express every amount in INR (₹).
If the user asks how to cut spending, point to the categories where they could save.
Do not ask follow-up questions."#;
}

fn context_contents(context: &[ContextTurn]) -> Vec<Content> {
    context
        .iter()
        .map(|turn| match turn.role {
            TurnRole::User => Content::user(turn.content.clone()),
            TurnRole::Assistant => Content::model(turn.content.clone()),
        })
        .collect()
}

#[async_trait]
impl CompletionBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn classify(
        &self,
        message: &str,
        context: &[ContextTurn],
        today: NaiveDate,
    ) -> Result<String> {
        let mut contents = context_contents(context);
        contents.push(Content::user(message));

        self.client
            .generate_json(&Self::classification_prompt(today), contents)
            .await
    }

    async fn dispatch(
        &self,
        question: &str,
        tools: &[ToolDeclaration],
        today: NaiveDate,
    ) -> Result<Option<FunctionCall>> {
        let declarations = tools
            .iter()
            .map(|t| FunctionDeclaration {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();

        self.client
            .generate_function_call(&Self::dispatch_prompt(today), question, declarations)
            .await
    }

    async fn summarize(&self, raw: &Value, query: &str) -> Result<String> {
        let prompt = format!(
            "Question: {}\n\nResult of the query: {}",
            query,
            serde_json::to_string(raw)?
        );
        self.client.generate_text(Self::SUMMARY_PROMPT, &prompt).await
    }
}
