//! Gemini API client
//!
//! Thin wire layer over `generateContent`. Uses a long-lived
//! reqwest::Client for connection pooling. Prompting lives in
//! `backend::gemini`.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::AppError;
use crate::Result;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Raw `generateContent` call
    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        if self.api_key.is_empty() {
            return Err(AppError::LlmError("GEMINI_API_KEY not configured".to_string()));
        }

        let url = format!("{}/{}:generateContent", BASE_URL, self.model);
        debug!(model = %self.model, "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AppError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(AppError::LlmError(format!(
                "Gemini API error ({}): {}",
                status, error_text
            )));
        }

        response.json::<GenerateResponse>().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AppError::LlmError(format!("Gemini parse error: {}", e))
        })
    }

    /// JSON-mode completion; returns the model's text verbatim
    pub async fn generate_json(&self, system: &str, contents: Vec<Content>) -> Result<String> {
        let request = GenerateRequest {
            contents,
            system_instruction: Some(Content::system(system)),
            generation_config: Some(GenerationConfig {
                temperature: Some(0.1),
                response_mime_type: Some("application/json".to_string()),
            }),
            tools: None,
            tool_config: None,
        };

        let response = self.generate(&request).await?;
        response
            .first_text()
            .ok_or_else(|| AppError::LlmError("Empty response from Gemini".to_string()))
    }

    /// Forced single function call; `None` when the model answered with text
    pub async fn generate_function_call(
        &self,
        system: &str,
        prompt: &str,
        declarations: Vec<FunctionDeclaration>,
    ) -> Result<Option<FunctionCall>> {
        let request = GenerateRequest {
            contents: vec![Content::user(prompt)],
            system_instruction: Some(Content::system(system)),
            generation_config: Some(GenerationConfig {
                temperature: Some(0.0),
                response_mime_type: None,
            }),
            tools: Some(vec![ToolSpec {
                function_declarations: declarations,
            }]),
            tool_config: Some(ToolConfig {
                function_calling_config: FunctionCallingConfig {
                    mode: "ANY".to_string(),
                },
            }),
        };

        let response = self.generate(&request).await?;
        Ok(response.first_function_call())
    }

    /// Plain text completion
    pub async fn generate_text(&self, system: &str, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![Content::user(prompt)],
            system_instruction: Some(Content::system(system)),
            generation_config: Some(GenerationConfig {
                temperature: Some(0.3),
                response_mime_type: None,
            }),
            tools: None,
            tool_config: None,
        };

        let response = self.generate(&request).await?;
        response
            .first_text()
            .ok_or_else(|| AppError::LlmError("Empty response from Gemini".to_string()))
    }
}

// =============================
// Wire types
// =============================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role("user", text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::with_role("model", text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }

    fn with_role(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            function_call: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Serialize)]
pub struct FunctionCallingConfig {
    pub mode: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
}

impl GenerateResponse {
    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.candidates
            .iter()
            .take(1)
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
    }

    /// Concatenated text of the first candidate
    pub fn first_text(&self) -> Option<String> {
        let text: String = self.parts().filter_map(|p| p.text.as_deref()).collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn first_function_call(&self) -> Option<FunctionCall> {
        self.parts().find_map(|p| p.function_call.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_call_request_serialization() {
        let request = GenerateRequest {
            contents: vec![Content::user("How much on food?")],
            system_instruction: Some(Content::system("Today is 2024-01-15")),
            generation_config: None,
            tools: Some(vec![ToolSpec {
                function_declarations: vec![FunctionDeclaration {
                    name: "getTotalSpent".into(),
                    description: "Total".into(),
                    parameters: json!({"type": "object", "properties": {}}),
                }],
            }]),
            tool_config: Some(ToolConfig {
                function_calling_config: FunctionCallingConfig { mode: "ANY".into() },
            }),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "Today is 2024-01-15");
        assert_eq!(
            value["tools"][0]["functionDeclarations"][0]["name"],
            "getTotalSpent"
        );
        assert_eq!(value["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
        assert!(value.get("generationConfig").is_none());
    }

    #[test]
    fn test_response_extracts_function_call_and_text() {
        let raw = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"functionCall": {"name": "getTotalSpent", "args": {"category": "Food"}}}
                    ]
                },
                "finishReason": "STOP"
            }]
        });
        let response: GenerateResponse = serde_json::from_value(raw).unwrap();
        let call = response.first_function_call().unwrap();
        assert_eq!(call.name, "getTotalSpent");
        assert_eq!(call.args["category"], "Food");
        assert!(response.first_text().is_none());

        let text: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "You spent "}, {"text": "₹250"}]}}]
        }))
        .unwrap();
        assert_eq!(text.first_text().as_deref(), Some("You spent ₹250"));
        assert!(text.first_function_call().is_none());
    }

    #[test]
    fn test_empty_response() {
        let response: GenerateResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.first_text().is_none());
    }
}
