//! Language model client with streaming generation.
//!
//! ## Streaming contract
//!
//! `generate_streaming` returns a `TokenStream` backed by a reader task.
//! Two deadlines apply: a large first-token deadline (prompt evaluation
//! dominates cold latency) and a small inter-token deadline. Missing
//! either one pushes a terminating apology token and ends the stream, so
//! the caller always has something speakable. Dropping the `TokenStream`
//! aborts the reader task, which frees the upstream HTTP connection
//! promptly.
//!
//! The wire format is the Ollama `/api/chat` NDJSON stream.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{Result, SwitchboardError};

/// Spoken when the model misses the first-token deadline.
pub const APOLOGY_SLOW: &str = "I'm sorry, I'm taking too long to respond.";
/// Appended when the model stalls mid-stream.
pub const APOLOGY_PAUSE: &str = " I need to pause here.";
/// Spoken when the backend fails outright.
pub const APOLOGY_ERROR: &str = "I'm sorry, I encountered an error. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Result of a non-streaming generation.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub tokens_generated: u32,
    pub generation_time_ms: f64,
}

/// Bounded per-call conversation history.
///
/// Invariants: all system messages precede the first non-system message,
/// and the non-system count never exceeds `2 · max_history`. The count is
/// tracked incrementally, never recomputed.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    messages: Vec<Message>,
    max_history: usize,
    system_len: usize,
    non_system_len: usize,
}

impl ConversationContext {
    pub fn new(max_history: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_history: max_history.max(1),
            system_len: 0,
            non_system_len: 0,
        }
    }

    pub fn with_system_prompt(prompt: impl Into<String>, max_history: usize) -> Self {
        let mut context = Self::new(max_history);
        context.set_system_prompt(prompt);
        context
    }

    /// Replace the system message (inserting one if absent).
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let message = Message::new(Role::System, prompt);
        if self.system_len > 0 {
            self.messages[0] = message;
            // Collapse any extra system messages into the single canonical one.
            while self.system_len > 1 {
                self.messages.remove(1);
                self.system_len -= 1;
            }
        } else {
            self.messages.insert(0, message);
            self.system_len = 1;
        }
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::new(Role::User, content));
        self.non_system_len += 1;
        self.trim();
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::new(Role::Assistant, content));
        self.non_system_len += 1;
        self.trim();
    }

    fn trim(&mut self) {
        while self.non_system_len > self.max_history * 2 {
            // The oldest non-system message sits right after the system block.
            self.messages.remove(self.system_len);
            self.non_system_len -= 1;
        }
    }

    /// Drop the conversation, keeping system messages only.
    pub fn clear(&mut self) {
        self.messages.truncate(self.system_len);
        self.non_system_len = 0;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn non_system_len(&self) -> usize {
        self.non_system_len
    }

    pub fn system_prompt(&self) -> Option<&str> {
        if self.system_len > 0 {
            Some(&self.messages[0].content)
        } else {
            None
        }
    }
}

/// Streaming token sequence from the model.
///
/// Dropping the stream aborts the reader task, closing the upstream
/// connection.
pub struct TokenStream {
    rx: mpsc::Receiver<String>,
    task: Option<JoinHandle<()>>,
}

impl TokenStream {
    fn from_task(rx: mpsc::Receiver<String>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// A preloaded stream, mainly for stubs and tests.
    pub fn from_tokens(tokens: Vec<String>) -> Self {
        let (tx, rx) = mpsc::channel(tokens.len().max(1));
        for token in tokens {
            let _ = tx.try_send(token);
        }
        Self { rx, task: None }
    }

    pub async fn next_token(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Contract for language-model backends.
///
/// `context` carries the history to send; callers own all context
/// mutation (user message recorded before the stream begins, assembled
/// assistant message after completion).
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str, context: &ConversationContext) -> Result<LlmResponse>;

    async fn generate_streaming(
        &self,
        prompt: &str,
        context: &ConversationContext,
    ) -> Result<TokenStream>;
}

// ---------------------------------------------------------------------------
// Ollama wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ChatResponsePart {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// HTTP client for an Ollama-compatible chat endpoint.
pub struct OllamaClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl OllamaClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.config.endpoint.trim_end_matches('/'))
    }

    fn request_body(&self, prompt: &str, context: &ConversationContext, stream: bool) -> serde_json::Value {
        let mut messages: Vec<WireMessage<'_>> = context
            .messages()
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role),
                content: &m.content,
            })
            .collect();
        messages.push(WireMessage {
            role: "user",
            content: prompt,
        });
        serde_json::to_value(ChatRequest {
            model: &self.config.model,
            messages,
            stream,
            options: ChatOptions {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                num_predict: self.config.max_tokens,
            },
        })
        .unwrap_or_else(|_| serde_json::json!({}))
    }

    /// One tiny generation to pull the model into memory at startup.
    pub async fn warm_up(&self) -> Result<()> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": "Hello"}],
            "stream": false,
            "options": {"num_predict": 1},
        });
        let response = self
            .http
            .post(self.chat_url())
            .json(&body)
            .timeout(Duration::from_secs(self.config.first_token_timeout_secs.max(1)))
            .send()
            .await
            .map_err(|e| SwitchboardError::Llm(format!("warm-up failed: {e}")))?;
        if !response.status().is_success() {
            return Err(SwitchboardError::Llm(format!(
                "warm-up returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn generate(&self, prompt: &str, context: &ConversationContext) -> Result<LlmResponse> {
        let start = Instant::now();
        let timeout = Duration::from_secs(self.config.first_token_timeout_secs.max(1));
        let body = self.request_body(prompt, context, false);

        let outcome = tokio::time::timeout(timeout, async {
            let response = self
                .http
                .post(self.chat_url())
                .json(&body)
                .send()
                .await
                .map_err(|e| SwitchboardError::Llm(e.to_string()))?;
            let part: ChatResponsePart = response
                .json()
                .await
                .map_err(|e| SwitchboardError::Llm(format!("malformed response: {e}")))?;
            Ok::<ChatResponsePart, SwitchboardError>(part)
        })
        .await;

        match outcome {
            Ok(Ok(part)) => Ok(LlmResponse {
                text: part.message.map(|m| m.content).unwrap_or_default(),
                tokens_generated: part.eval_count.unwrap_or(0),
                generation_time_ms: start.elapsed().as_secs_f64() * 1_000.0,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "generation timed out");
                Ok(LlmResponse {
                    text: APOLOGY_SLOW.to_string(),
                    tokens_generated: 0,
                    generation_time_ms: timeout.as_secs_f64() * 1_000.0,
                })
            }
        }
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        context: &ConversationContext,
    ) -> Result<TokenStream> {
        let body = self.request_body(prompt, context, true);
        let http = self.http.clone();
        let url = self.chat_url();
        let first_token = Duration::from_secs(self.config.first_token_timeout_secs.max(1));
        let inter_token = Duration::from_secs(self.config.inter_token_timeout_secs.max(1));

        let (tx, rx) = mpsc::channel::<String>(32);
        let task = tokio::spawn(async move {
            stream_tokens(http, url, body, first_token, inter_token, tx).await;
        });

        Ok(TokenStream::from_task(rx, task))
    }
}

async fn stream_tokens(
    http: reqwest::Client,
    url: String,
    body: serde_json::Value,
    first_token: Duration,
    inter_token: Duration,
    tx: mpsc::Sender<String>,
) {
    let response = match tokio::time::timeout(first_token, http.post(&url).json(&body).send()).await
    {
        Ok(Ok(response)) if response.status().is_success() => response,
        Ok(Ok(response)) => {
            warn!(status = %response.status(), "chat endpoint rejected request");
            let _ = tx.send(APOLOGY_ERROR.to_string()).await;
            return;
        }
        Ok(Err(e)) => {
            warn!("chat request failed: {e}");
            let _ = tx.send(APOLOGY_ERROR.to_string()).await;
            return;
        }
        Err(_) => {
            warn!(
                timeout_secs = first_token.as_secs(),
                "first token deadline missed before response"
            );
            let _ = tx.send(APOLOGY_SLOW.to_string()).await;
            return;
        }
    };

    let mut byte_stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    // Stays at the first-token deadline until one token has flowed.
    let mut deadline = first_token;

    loop {
        // Drain complete NDJSON lines already buffered.
        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatResponsePart>(line) {
                Ok(part) => {
                    if let Some(message) = part.message {
                        if !message.content.is_empty() {
                            if tx.send(message.content).await.is_err() {
                                // Receiver dropped: playback was cancelled.
                                return;
                            }
                            deadline = inter_token;
                        }
                    }
                    if part.done {
                        return;
                    }
                }
                Err(e) => {
                    debug!("skipping malformed stream line: {e}");
                }
            }
        }

        match tokio::time::timeout(deadline, byte_stream.next()).await {
            Ok(Some(Ok(bytes))) => buffer.extend_from_slice(&bytes),
            Ok(Some(Err(e))) => {
                warn!("chat stream error: {e}");
                let _ = tx.send(APOLOGY_ERROR.to_string()).await;
                return;
            }
            Ok(None) => return,
            Err(_) => {
                let apology = if deadline == first_token {
                    APOLOGY_SLOW
                } else {
                    APOLOGY_PAUSE
                };
                warn!(timeout_secs = deadline.as_secs(), "token deadline missed");
                let _ = tx.send(apology.to_string()).await;
                return;
            }
        }
    }
}

/// Canned backend for development and tests.
pub struct StubLlm {
    response: String,
}

impl StubLlm {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for StubLlm {
    async fn generate(&self, _prompt: &str, _context: &ConversationContext) -> Result<LlmResponse> {
        Ok(LlmResponse {
            text: self.response.clone(),
            tokens_generated: self.response.split_whitespace().count() as u32,
            generation_time_ms: 1.0,
        })
    }

    async fn generate_streaming(
        &self,
        _prompt: &str,
        _context: &ConversationContext,
    ) -> Result<TokenStream> {
        let tokens = self
            .response
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        Ok(TokenStream::from_tokens(tokens))
    }
}

/// Collects streamed tokens into speakable sentences.
///
/// A sentence is emitted when a delimiter appears and the prefix through
/// it is at least `min_length` characters after trimming; shorter prefixes
/// absorb the delimiter and keep accumulating. The scan position advances
/// monotonically between emissions, so total work is linear in the stream
/// length.
pub struct SentenceBuffer {
    buffer: String,
    delimiters: Vec<char>,
    min_length: usize,
    scan_pos: usize,
}

impl SentenceBuffer {
    pub fn new(min_length: usize, delimiters: &str) -> Self {
        Self {
            buffer: String::new(),
            delimiters: delimiters.chars().collect(),
            min_length: min_length.max(1),
            scan_pos: 0,
        }
    }

    /// Append a token; returns a completed sentence when one is ready.
    pub fn add_token(&mut self, token: &str) -> Option<String> {
        self.buffer.push_str(token);

        while let Some(found) = self.buffer[self.scan_pos..]
            .find(|c: char| self.delimiters.contains(&c))
        {
            let end = self.scan_pos + found + 1;
            let sentence = self.buffer[..end].trim();
            if sentence.chars().count() >= self.min_length {
                let sentence = sentence.to_string();
                self.buffer = self.buffer[end..].trim_start().to_string();
                self.scan_pos = 0;
                return Some(sentence);
            }
            // Too short: the delimiter joins the sentence under construction.
            self.scan_pos = end;
        }

        self.scan_pos = self.buffer.len();
        None
    }

    /// Remaining trimmed residue, if any.
    pub fn flush(&mut self) -> Option<String> {
        let residue = self.buffer.trim();
        if residue.is_empty() {
            self.clear();
            return None;
        }
        let residue = residue.to_string();
        self.clear();
        Some(residue)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan_pos = 0;
    }
}
