//! LLM API client: an Anthropic-style messages endpoint for structured
//! completions and an OpenAI-style endpoint for batched embeddings.

use crate::config::LlmConfig;
use crate::error::{ComputeError, Result};
use anyhow::Context as _;
use serde::Deserialize;
use std::time::Duration;

pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f64>,
}

impl LlmClient {
    pub fn new(config: LlmConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, config })
    }

    fn api_key(&self) -> Result<&str> {
        self.config
            .api_key
            .as_deref()
            .ok_or_else(|| ComputeError::Api("no API key configured".to_string()).into())
    }

    /// Run a completion expecting a single JSON object back. Returns the
    /// parsed value plus the raw text (preserved on schema failures).
    pub async fn complete_json(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<(serde_json::Value, String)> {
        let url = format!(
            "{}/v1/messages",
            self.config.completion_base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key()?)
            .header("anthropic-version", "2023-06-01")
            .json(&serde_json::json!({
                "model": model,
                "max_tokens": 2048,
                "messages": [{ "role": "user", "content": prompt }],
            }))
            .send()
            .await
            .map_err(classify_transport)?;

        let response = check_status(response).await?;
        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|error| ComputeError::Api(format!("invalid messages response: {error}")))?;

        let raw: String = body
            .content
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        let value = parse_json_output(&raw)
            .map_err(|error| ComputeError::Schema(format!("output is not JSON: {error}")))?;
        Ok((value, raw))
    }

    /// Embed a batch of inputs with one call. Vector order matches input
    /// order.
    pub async fn embed_batch(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f64>>> {
        let url = format!(
            "{}/v1/embeddings",
            self.config.embedding_base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key()?)
            .json(&serde_json::json!({ "model": model, "input": inputs }))
            .send()
            .await
            .map_err(classify_transport)?;

        let response = check_status(response).await?;
        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|error| ComputeError::Api(format!("invalid embeddings response: {error}")))?;

        let mut vectors = vec![Vec::new(); inputs.len()];
        for item in body.data {
            if item.index >= vectors.len() {
                return Err(ComputeError::Api(format!(
                    "embedding index {} out of range",
                    item.index
                ))
                .into());
            }
            vectors[item.index] = item.embedding;
        }
        if vectors.iter().any(Vec::is_empty) {
            return Err(
                ComputeError::Api("embeddings response missing items".to_string()).into(),
            );
        }
        Ok(vectors)
    }
}

fn classify_transport(error: reqwest::Error) -> crate::Error {
    if error.is_timeout() || error.is_connect() {
        ComputeError::Transient(error.to_string()).into()
    } else {
        ComputeError::Api(error.to_string()).into()
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    let detail = body.chars().take(200).collect::<String>();

    if status.as_u16() == 429 {
        Err(ComputeError::RateLimited { retry_after }.into())
    } else if status.is_server_error() {
        Err(ComputeError::Transient(format!("{status}: {detail}")).into())
    } else {
        Err(ComputeError::Api(format!("{status}: {detail}")).into())
    }
}

/// Models often wrap JSON in a code fence; accept both shapes.
fn parse_json_output(raw: &str) -> std::result::Result<serde_json::Value, serde_json::Error> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    serde_json::from_str(inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_and_bare_json_both_parse() {
        let bare = r#"{"topics": ["a"]}"#;
        let fenced = "```json\n{\"topics\": [\"a\"]}\n```";
        assert_eq!(
            parse_json_output(bare).expect("bare"),
            parse_json_output(fenced).expect("fenced")
        );
        assert!(parse_json_output("not json at all").is_err());
    }
}
