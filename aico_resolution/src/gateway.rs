//! Gateway capability traits and HTTP clients for the two external
//! services the pipeline depends on: text embedding and LLM completion.
//!
//! Both are modeled as single-method traits so test doubles (scripted
//! responses, hangs, failures) can replace them without touching network
//! code. The HTTP implementations speak the OpenAI-compatible wire format.

use std::time::Duration;

use aico_config::{CompletionGatewayConfig, EmbeddingGatewayConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;

/// Converts text to fixed-dimension vectors, batched.
///
/// The returned list must have the same length and order as the input;
/// a count mismatch is treated as a hard failure by the caller.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Runs one batch-classification prompt and returns the raw completion
/// text. Timeout enforcement is the caller's responsibility.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Extracts ordered vectors from an OpenAI-compatible `/embeddings`
/// response, validating count and dimension.
fn parse_embedding_response(
    body: &serde_json::Value,
    expected_count: usize,
    expected_dim: usize,
) -> Result<Vec<Vec<f32>>> {
    let data = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("embedding response missing 'data' array"))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .ok_or_else(|| anyhow!("embedding item missing 'index'"))? as usize;
        let vector: Vec<f32> = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("embedding item missing 'embedding'"))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);

    if indexed.len() != expected_count {
        return Err(anyhow!(
            "embedding count mismatch: expected {}, got {}",
            expected_count,
            indexed.len()
        ));
    }
    for (i, v) in &indexed {
        if v.len() != expected_dim {
            return Err(anyhow!(
                "embedding {} has dimension {}, expected {}",
                i,
                v.len(),
                expected_dim
            ));
        }
    }
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Extracts the assistant message content from an OpenAI-compatible
/// `/chat/completions` response.
fn extract_completion_content(body: &serde_json::Value) -> Result<String> {
    body["choices"]
        .get(0)
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("completion response missing choices[0].message.content"))
}

/// HTTP embedding client against an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddingGateway {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl HttpEmbeddingGateway {
    pub fn from_config(config: &EmbeddingGatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client for embedding gateway")?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl EmbeddingGateway for HttpEmbeddingGateway {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.endpoint);
        let body = json!({
            "model": self.model,
            "input": texts,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .context("Embedding gateway request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Embedding gateway returned {}: {}", status, text));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse embedding gateway response")?;
        parse_embedding_response(&body, texts.len(), self.dimension)
    }
}

/// HTTP completion client against an OpenAI-compatible `/chat/completions`
/// endpoint.
pub struct HttpCompletionGateway {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl HttpCompletionGateway {
    pub fn from_config(config: &CompletionGatewayConfig) -> Result<Self> {
        let client = reqwest::Client::new();
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl CompletionGateway for HttpCompletionGateway {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .context("Completion gateway request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Completion gateway returned {}: {}", status, text));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse completion gateway response")?;
        extract_completion_content(&body)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embedding_response_orders_by_index() {
        let body = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] },
            ]
        });
        let vectors = parse_embedding_response(&body, 2, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }

    #[test]
    fn test_parse_embedding_response_count_mismatch() {
        let body = json!({
            "data": [{ "index": 0, "embedding": [1.0, 0.0] }]
        });
        let err = parse_embedding_response(&body, 2, 2).unwrap_err();
        assert!(err.to_string().contains("count mismatch"));
    }

    #[test]
    fn test_parse_embedding_response_dimension_mismatch() {
        let body = json!({
            "data": [{ "index": 0, "embedding": [1.0, 0.0, 0.0] }]
        });
        let err = parse_embedding_response(&body, 1, 2).unwrap_err();
        assert!(err.to_string().contains("dimension"));
    }

    #[test]
    fn test_parse_embedding_response_missing_data() {
        let body = json!({ "error": "rate limited" });
        assert!(parse_embedding_response(&body, 1, 2).is_err());
    }

    #[test]
    fn test_extract_completion_content() {
        let body = json!({
            "choices": [
                { "message": { "role": "assistant", "content": "[]" } }
            ]
        });
        assert_eq!(extract_completion_content(&body).unwrap(), "[]");
    }

    #[test]
    fn test_extract_completion_content_missing() {
        let body = json!({ "choices": [] });
        assert!(extract_completion_content(&body).is_err());
    }

    #[tokio::test]
    async fn test_mock_confirm_all_reads_pair_ids() {
        use mock::{CompletionScript, MockCompletionGateway};

        let gateway = MockCompletionGateway::new(CompletionScript::ConfirmAll);
        let prompt = "Pairs:\n0. [PERSON] \"Sarah\" | [PERSON] \"Sarah Chen\" (similarity 0.88)\n1. [PROJECT] \"a\" | [PROJECT] \"b\" (similarity 0.90)\n";
        let out = gateway.complete("sys", prompt).await.unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["pair_id"], 0);
        assert_eq!(parsed[1]["pair_id"], 1);
        assert_eq!(parsed[0]["is_duplicate"], true);
    }
}
