//! Ollama HTTP client.
//!
//! - `POST /api/embed` for embeddings (one text per call; the orchestrator
//!   owns concurrency and retries)
//! - `POST /api/chat` with `stream: true` for completions, read as NDJSON
//! - `GET /api/tags` for installed models and health checks

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;

use super::EmbeddingProvider;
use crate::chat::{ChatMessage, CompletionProvider, TokenStream};
use crate::config::OllamaConfig;
use crate::error::{ProviderError, RagError, Stage};

/// Embedding and completion provider backed by a local Ollama instance.
///
/// Requires Ollama to be running with the configured models pulled
/// (e.g. `ollama pull nomic-embed-text`).
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    endpoint: String,
    request_timeout: Duration,
}

impl OllamaProvider {
    pub fn new(config: &OllamaConfig, request_timeout: Duration) -> Result<Self, RagError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Names of the models installed in Ollama.
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.endpoint))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| classify_send_error(&self.endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid /api/tags response: {}", e)))?;
        parse_tags_response(&json)
    }

    /// Check if Ollama is reachable.
    pub async fn health_check(&self) -> Result<(), ProviderError> {
        self.list_models().await.map(|_| ())
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn embed(&self, model_id: &str, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = serde_json::json!({
            "model": model_id,
            "input": text,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.endpoint))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(&self.endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid /api/embed response: {}", e)))?;
        parse_embed_response(&json)
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    async fn stream_chat(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<TokenStream, ProviderError> {
        let body = serde_json::json!({
            "model": model_id,
            "messages": messages,
            "stream": true,
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(&self.endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()));
        Ok(ndjson_tokens(Box::pin(bytes)))
    }
}

fn classify_send_error(endpoint: &str, e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Transient(format!("request to {} timed out", endpoint))
    } else if e.is_connect() {
        ProviderError::Unreachable(format!("is Ollama running at {}? {}", endpoint, e))
    } else {
        ProviderError::Transient(e.to_string())
    }
}

fn classify_status(status: u16, body: &str) -> ProviderError {
    let message = format!("Ollama API error {}: {}", status, body.trim());
    if status == 429 || (500..600).contains(&status) {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

fn parse_embed_response(json: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
    let first = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .ok_or_else(|| {
            ProviderError::Permanent("invalid Ollama response: missing embeddings array".into())
        })?;

    first
        .as_array()
        .ok_or_else(|| {
            ProviderError::Permanent("invalid Ollama response: embedding is not an array".into())
        })?
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                ProviderError::Permanent("invalid Ollama response: non-numeric component".into())
            })
        })
        .collect()
}

fn parse_tags_response(json: &serde_json::Value) -> Result<Vec<String>, ProviderError> {
    let models = json
        .get("models")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProviderError::Permanent("invalid /api/tags response".into()))?;

    Ok(models
        .iter()
        .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunkMessage {
    #[serde(default)]
    content: String,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, String>> + Send>>;

struct LineReader {
    bytes: ByteStream,
    buf: Vec<u8>,
    finished: bool,
}

enum Line {
    Token(String),
    Skip,
    Done,
}

fn parse_chat_line(line: &[u8]) -> Result<Line, RagError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(Line::Skip);
    }

    let chunk: ChatChunk = serde_json::from_str(line).map_err(|e| {
        RagError::provider(
            Stage::Generate,
            ProviderError::Permanent(format!("malformed chat stream line: {}", e)),
        )
    })?;
    if let Some(error) = chunk.error {
        return Err(RagError::provider(
            Stage::Generate,
            ProviderError::Permanent(error),
        ));
    }

    let content = chunk.message.map(|m| m.content).unwrap_or_default();
    if chunk.done && content.is_empty() {
        Ok(Line::Done)
    } else if content.is_empty() {
        Ok(Line::Skip)
    } else {
        Ok(Line::Token(content))
    }
}

/// Decode an NDJSON chat response into a stream of content tokens.
/// Lines may be split across network chunks.
fn ndjson_tokens(bytes: ByteStream) -> TokenStream {
    let reader = LineReader {
        bytes,
        buf: Vec::new(),
        finished: false,
    };

    Box::pin(stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                match parse_chat_line(&line) {
                    Ok(Line::Token(token)) => return Some((Ok(token), reader)),
                    Ok(Line::Skip) => continue,
                    Ok(Line::Done) => return None,
                    Err(e) => {
                        reader.buf.clear();
                        reader.finished = true;
                        return Some((Err(e), reader));
                    }
                }
            }

            if reader.finished {
                if reader.buf.is_empty() {
                    return None;
                }
                // trailing line without a newline
                reader.buf.push(b'\n');
                continue;
            }

            match reader.bytes.next().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.buf.clear();
                    reader.finished = true;
                    let err = RagError::provider(Stage::Generate, ProviderError::Transient(e));
                    return Some((Err(err), reader));
                }
                None => reader.finished = true,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(parts: Vec<&'static str>) -> ByteStream {
        Box::pin(stream::iter(
            parts.into_iter().map(|p| Ok(p.as_bytes().to_vec())),
        ))
    }

    #[test]
    fn test_parse_embed_response() {
        let json = serde_json::json!({"model": "m", "embeddings": [[0.5, -1.0, 2.0]]});
        assert_eq!(parse_embed_response(&json).unwrap(), vec![0.5, -1.0, 2.0]);

        let bad = serde_json::json!({"embedding": [0.5]});
        assert!(matches!(
            parse_embed_response(&bad),
            Err(ProviderError::Permanent(_))
        ));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(429, "slow down").is_transient());
        assert!(classify_status(503, "").is_transient());
        assert!(matches!(
            classify_status(404, "model not found"),
            ProviderError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(400, "bad"),
            ProviderError::Permanent(_)
        ));
    }

    #[test]
    fn test_parse_tags_response() {
        let json = serde_json::json!({"models": [{"name": "nomic-embed-text:latest"}, {"name": "gemma3:270m"}]});
        assert_eq!(
            parse_tags_response(&json).unwrap(),
            vec!["nomic-embed-text:latest", "gemma3:270m"]
        );
    }

    #[tokio::test]
    async fn test_ndjson_tokens_handles_split_lines() {
        let parts = vec![
            "{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"mess",
            "age\":{\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
            "{\"message\":{\"content\":\"ignored\"},\"done\":false}\n",
        ];
        let tokens: Vec<String> = ndjson_tokens(byte_stream(parts))
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_ndjson_tokens_trailing_line_without_newline() {
        let parts = vec!["{\"message\":{\"content\":\"end\"},\"done\":false}"];
        let tokens: Vec<String> = ndjson_tokens(byte_stream(parts))
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["end"]);
    }

    #[tokio::test]
    async fn test_ndjson_tokens_surfaces_provider_error() {
        let parts = vec!["{\"error\":\"model 'x' not found\"}\n"];
        let items: Vec<_> = ndjson_tokens(byte_stream(parts)).collect().await;
        assert_eq!(items.len(), 1);
        let err = items.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.stage(), Stage::Generate);
        assert_eq!(err.kind(), "provider_permanent");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_classified() {
        let config = OllamaConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            ..OllamaConfig::default()
        };
        let provider = OllamaProvider::new(&config, Duration::from_secs(5)).unwrap();
        let err = provider.embed("nomic-embed-text", "hello").await.unwrap_err();
        assert!(err.is_unreachable(), "got {:?}", err);
    }
}
