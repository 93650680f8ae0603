//! Adapter for OpenAI-compatible servers: `data: {json}` lines terminated by
//! a literal `[DONE]` marker.

use std::collections::VecDeque;

use serde_json::{json, Value};

use crate::config::ProviderConfig;
use crate::error::{AppError, AppResult};
use crate::protocol::{DeltaDedup, LineBuffer, StreamEvent};

#[derive(Debug, Default)]
pub struct OpenAiDecoder {
    dedup: DeltaDedup,
}

impl OpenAiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode_line(&mut self, raw: &str) -> Vec<StreamEvent> {
        let line = raw.trim();
        if line.is_empty() {
            return Vec::new();
        }
        // SSE comments and non-data fields (`event:`, `: keepalive`) carry no
        // payload for us.
        let Some(payload) = line.strip_prefix("data:") else {
            log::debug!("[OpenAI] ignoring non-data line");
            return Vec::new();
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            return vec![StreamEvent::Done];
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("[OpenAI] skipping undecodable frame: {}", e);
                return Vec::new();
            }
        };

        if let Some(text) = decode_choice_delta(&value) {
            if text.is_empty() || !self.dedup.accept(&text) {
                return Vec::new();
            }
            return vec![StreamEvent::TextDelta(text)];
        }
        if let Some(text) = value.get("output_text").and_then(Value::as_str) {
            return vec![StreamEvent::TextReplace(text.to_string())];
        }

        log::debug!("[OpenAI] frame matched no decoder");
        Vec::new()
    }
}

/// `choices[0].delta.content` on chat/completions; some servers flatten it to
/// a bare `delta.content`.
fn decode_choice_delta(value: &Value) -> Option<String> {
    value
        .pointer("/choices/0/delta/content")
        .or_else(|| value.pointer("/delta/content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub struct OpenAiStream {
    response: reqwest::Response,
    buffer: LineBuffer,
    decoder: OpenAiDecoder,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl OpenAiStream {
    pub(crate) fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: LineBuffer::new(),
            decoder: OpenAiDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    pub async fn next_event(&mut self) -> AppResult<Option<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event == StreamEvent::Done {
                    self.finished = true;
                }
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.response.chunk().await {
                Ok(Some(bytes)) => {
                    for line in self.buffer.push(&bytes) {
                        self.pending.extend(self.decoder.decode_line(&line));
                    }
                }
                Ok(None) => {
                    self.finished = true;
                    if let Some(rest) = self.buffer.take_remainder() {
                        self.pending.extend(self.decoder.decode_line(&rest));
                    }
                }
                Err(e) => {
                    self.finished = true;
                    return Err(AppError::Transport(format!("stream read failed: {e}")));
                }
            }
        }
    }
}

/// Open a streaming completion. `messages` follows the chat wire shape
/// (`{role, content}` objects); the responses surface reuses them as `input`.
pub async fn open_chat_stream(
    http: &reqwest::Client,
    config: &ProviderConfig,
    messages: Vec<Value>,
) -> AppResult<OpenAiStream> {
    let response = send_chat(http, config, messages, true, None).await?;
    Ok(OpenAiStream::new(response))
}

/// One-shot completion used for side calls (session titling).
pub async fn chat_once(
    http: &reqwest::Client,
    config: &ProviderConfig,
    messages: Vec<Value>,
    timeout: std::time::Duration,
) -> AppResult<String> {
    let response = send_chat(http, config, messages, false, Some(timeout)).await?;
    let body: Value = response
        .json()
        .await
        .map_err(|e| AppError::Transport(format!("completion was not JSON: {e}")))?;
    body.pointer("/choices/0/message/content")
        .or_else(|| body.pointer("/output_text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Internal("completion carried no content".into()))
}

async fn send_chat(
    http: &reqwest::Client,
    config: &ProviderConfig,
    messages: Vec<Value>,
    stream: bool,
    timeout: Option<std::time::Duration>,
) -> AppResult<reqwest::Response> {
    let model = config
        .model
        .as_deref()
        .ok_or_else(|| AppError::InvalidRequest("no model configured".into()))?;
    let base = config.base_url.trim_end_matches('/');

    let (url, body) = if config.use_responses_api {
        (
            format!("{base}/api/v1/responses"),
            json!({ "model": model, "input": messages, "stream": stream }),
        )
    } else {
        (
            format!("{base}/chat/completions"),
            json!({ "model": model, "messages": messages, "stream": stream }),
        )
    };

    let mut request = http.post(&url).json(&body);
    if let Some(key) = &config.api_key {
        request = request.bearer_auth(key);
    }
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }

    let response = request
        .send()
        .await
        .map_err(|e| AppError::Transport(format!("completion call failed: {e}")))?;
    if !response.status().is_success() {
        return Err(AppError::Transport(format!(
            "completion call returned {}",
            response.status()
        )));
    }
    Ok(response)
}
