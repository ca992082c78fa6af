use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{RagError, Result};

/// Stream of generated text fragments, one per token/chunk.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

const SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer in clear, natural language using only the material you are given.";

/// Streaming requests may legitimately run long; sync calls use the client default.
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            temperature,
            max_tokens,
        }
    }
}

/// The chat model, used for answers and for auxiliary judgement prompts.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, request: &GenerationRequest) -> Result<String>;

    /// Dropping the returned stream cancels the upstream request.
    async fn stream(&self, request: &GenerationRequest) -> Result<TokenStream>;
}

/// Chat client for Ollama or OpenAI-compatible APIs.
pub struct ChatClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl ChatClient {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }

    fn messages(&self, prompt: &str) -> Vec<Message> {
        vec![
            Message {
                role: "system".to_string(),
                content: SYSTEM_PROMPT.to_string(),
            },
            Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            },
        ]
    }
}

#[async_trait]
impl Generator for ChatClient {
    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        match self.config.provider.as_str() {
            "ollama" => self.complete_ollama(request).await,
            "openai" => self.complete_openai(request).await,
            other => Err(RagError::Config(format!("Unknown LLM provider: {other}"))),
        }
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<TokenStream> {
        match self.config.provider.as_str() {
            "ollama" => self.stream_ollama(request).await,
            "openai" => self.stream_openai(request).await,
            other => Err(RagError::Config(format!(
                "Unsupported LLM provider for chat: {other}"
            ))),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Message,
}

#[derive(Deserialize)]
struct OllamaStreamChunk {
    message: Message,
    done: bool,
}

impl ChatClient {
    fn ollama_request(&self, request: &GenerationRequest, stream: bool) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.config.chat_model.clone(),
            messages: self.messages(&request.prompt),
            stream,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }

    async fn complete_ollama(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/api/chat", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&self.ollama_request(request, false))
            .send()
            .await
            .map_err(|e| RagError::Generation(format!("Failed to call Ollama chat API: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::Generation(format!(
                "Ollama chat API returned {status}: {body}"
            )));
        }

        let body: OllamaChatResponse = resp
            .json()
            .await
            .map_err(|e| RagError::Generation(format!("Failed to parse Ollama response: {e}")))?;
        Ok(body.message.content)
    }

    async fn stream_ollama(&self, request: &GenerationRequest) -> Result<TokenStream> {
        let url = format!("{}/api/chat", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(STREAM_TIMEOUT)
            .json(&self.ollama_request(request, true))
            .send()
            .await
            .map_err(|e| {
                RagError::Generation(format!("Failed to connect to Ollama for chat streaming: {e}"))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::Generation(format!(
                "Ollama chat API returned {status}: {body}"
            )));
        }

        let stream = stream_lines(resp.bytes_stream()).filter_map(|line_result| async move {
            match line_result {
                Ok(line) => parse_ollama_line(&line),
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Parse a single Ollama streaming line. Returns:
/// - Some(Ok(content)) for content deltas
/// - Some(Err(e)) for parse errors
/// - None to skip (empty content or done signal)
fn parse_ollama_line(line: &str) -> Option<Result<String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str::<OllamaStreamChunk>(line) {
        Ok(chunk) => {
            if chunk.done || chunk.message.content.is_empty() {
                return None;
            }
            Some(Ok(chunk.message.content))
        }
        Err(e) => Some(Err(RagError::Generation(format!(
            "Failed to parse Ollama chunk: {e}"
        )))),
    }
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

impl ChatClient {
    fn openai_request(&self, request: &GenerationRequest, stream: bool) -> OpenAiChatRequest {
        OpenAiChatRequest {
            model: self.config.chat_model.clone(),
            messages: self.messages(&request.prompt),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.config.api_key.as_deref().unwrap_or(""))
    }

    async fn complete_openai(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.bearer())
            .json(&self.openai_request(request, false))
            .send()
            .await
            .map_err(|e| RagError::Generation(format!("Failed to call OpenAI chat API: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::Generation(format!(
                "OpenAI chat API returned {status}: {body}"
            )));
        }

        let body: OpenAiChatResponse = resp
            .json()
            .await
            .map_err(|e| RagError::Generation(format!("Failed to parse OpenAI response: {e}")))?;
        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn stream_openai(&self, request: &GenerationRequest) -> Result<TokenStream> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(STREAM_TIMEOUT)
            .header("Authorization", self.bearer())
            .json(&self.openai_request(request, true))
            .send()
            .await
            .map_err(|e| {
                RagError::Generation(format!("Failed to connect to OpenAI for chat streaming: {e}"))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::Generation(format!(
                "OpenAI chat API returned {status}: {body}"
            )));
        }

        let stream = stream_lines(resp.bytes_stream()).filter_map(|line_result| async move {
            match line_result {
                Ok(line) => parse_openai_line(&line),
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Parse a single OpenAI SSE line. Returns:
/// - Some(Ok(content)) for content deltas
/// - Some(Err(e)) for parse errors
/// - None to skip (empty lines, [DONE], role-only chunks)
fn parse_openai_line(line: &str) -> Option<Result<String>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default();
            if content.is_empty() {
                return None;
            }
            Some(Ok(content))
        }
        Err(e) => Some(Err(RagError::Generation(format!(
            "Failed to parse OpenAI chunk: {e}"
        )))),
    }
}

// ─── Line buffering ──────────────────────────────────────

/// Convert a byte stream into a stream of complete lines.
fn stream_lines(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        (Box::pin(byte_stream), String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].to_string();
                    buffer.drain(..=newline_pos);
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (stream, buffer)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(RagError::Generation(format!("Stream read error: {e}"))),
                            (stream, buffer),
                        ));
                    }
                    None => {
                        // Upstream closed; flush a trailing unterminated line
                        if !buffer.trim().is_empty() {
                            let remaining = std::mem::take(&mut buffer);
                            return Some((Ok(remaining), (stream, buffer)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}
