//! Adapter for workflow-automation servers that stream newline-delimited
//! JSON run events.
//!
//! Frames are duck-typed on the wire: depending on server version the text
//! may arrive under `data.chunk`, `delta.content`, `output_text` and friends.
//! Each line is therefore run through an ordered list of typed decoders;
//! the first match wins and lines matching nothing are skipped.

use std::collections::VecDeque;

use serde_json::{json, Value};

use crate::config::ProviderConfig;
use crate::error::{AppError, AppResult};
use crate::models::message::{Attachment, ProcessStep, StepKind};
use crate::protocol::{DeltaDedup, LineBuffer, StreamEvent};

/// Stateful line decoder. Owns the dedup window so a re-sent token frame is
/// suppressed no matter how the two copies were framed.
#[derive(Debug, Default)]
pub struct LangflowDecoder {
    dedup: DeltaDedup,
}

impl LangflowDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one complete line into zero or more events.
    pub fn decode_line(&mut self, raw: &str) -> Vec<StreamEvent> {
        let line = normalize_line(raw);
        if line.is_empty() {
            return Vec::new();
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("[Langflow] skipping undecodable frame ({}): {}", e, preview(line));
                return Vec::new();
            }
        };

        if let Some(chunk) = decode_token(&value) {
            return self.emit_delta(chunk);
        }
        if let Some(steps) = decode_step_batch(&value) {
            return vec![StreamEvent::Steps(steps)];
        }
        if let Some((text, steps)) = decode_end(&value) {
            let mut events = Vec::new();
            if let Some(text) = text {
                events.push(StreamEvent::TextReplace(text));
            }
            if let Some(steps) = steps {
                events.push(StreamEvent::Steps(steps));
            }
            events.push(StreamEvent::Done);
            return events;
        }
        if let Some(chunk) = decode_loose_text(&value) {
            return self.emit_delta(chunk);
        }

        log::debug!("[Langflow] frame matched no decoder: {}", preview(line));
        Vec::new()
    }

    fn emit_delta(&mut self, chunk: String) -> Vec<StreamEvent> {
        if self.dedup.accept(&chunk) {
            vec![StreamEvent::TextDelta(chunk)]
        } else {
            log::debug!("[Langflow] suppressed re-sent chunk");
            Vec::new()
        }
    }
}

/// Strip the transport dressing some deployments put in front of the JSON:
/// a UTF-8 BOM and/or an SSE-style `data:` field name.
fn normalize_line(raw: &str) -> &str {
    let line = raw.trim_start_matches('\u{feff}').trim();
    match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => line,
    }
}

fn preview(line: &str) -> String {
    line.chars().take(120).collect()
}

/// `event:"token"` / `event:"message"` frames carry the next chunk in
/// `data.chunk`.
fn decode_token(value: &Value) -> Option<String> {
    let event = value.get("event")?.as_str()?;
    if event != "token" && event != "message" {
        return None;
    }
    value
        .pointer("/data/chunk")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `event:"add_message"` frames, and any frame carrying `data.content_blocks`,
/// deliver the full step list so far.
fn decode_step_batch(value: &Value) -> Option<Vec<ProcessStep>> {
    if value.get("event").and_then(Value::as_str) == Some("end") {
        return None;
    }
    let blocks = value.pointer("/data/content_blocks")?.as_array()?;
    Some(parse_content_blocks(blocks))
}

/// `event:"end"` carries the authoritative final text plus any trailing steps.
fn decode_end(value: &Value) -> Option<(Option<String>, Option<Vec<ProcessStep>>)> {
    if value.get("event").and_then(Value::as_str) != Some("end") {
        return None;
    }
    let data = value.get("data");
    let text = data.and_then(final_message_text);
    let steps = data
        .and_then(|d| d.pointer("/content_blocks"))
        .and_then(Value::as_array)
        .map(|blocks| parse_content_blocks(blocks));
    Some((text, steps))
}

/// The end frame nests the final text differently across server versions;
/// try the flat shape first, then the run-outputs shape.
fn final_message_text(data: &Value) -> Option<String> {
    if let Some(text) = data.pointer("/result/message/text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    data.pointer("/result/outputs/0/outputs/0/results/message/text")
        .or_else(|| data.pointer("/result/outputs/0/outputs/0/results/message/data/text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Last-resort extractors for frames with no `event` discriminator, in
/// priority order.
fn decode_loose_text(value: &Value) -> Option<String> {
    if let Some(text) = value.pointer("/delta/content").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    for key in ["output_text", "output", "text", "content"] {
        if let Some(text) = value.get(key).and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    value.get("chunk").and_then(Value::as_str).map(str::to_string)
}

fn parse_content_blocks(blocks: &[Value]) -> Vec<ProcessStep> {
    let mut steps = Vec::new();
    for block in blocks {
        let block_title = block.get("title").and_then(Value::as_str);
        let Some(contents) = block.get("contents").and_then(Value::as_array) else {
            continue;
        };
        for item in contents {
            let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
            let kind = step_kind(item_type);
            let title = item
                .get("name")
                .and_then(Value::as_str)
                .or(block_title)
                .unwrap_or(item_type)
                .to_string();
            let detail = item
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    item.get("tool_input")
                        .map(|input| input.to_string())
                });
            steps.push(ProcessStep { kind, title, detail });
        }
    }
    steps
}

fn step_kind(item_type: &str) -> StepKind {
    if item_type.contains("tool") || item_type.contains("command") {
        StepKind::Command
    } else if item_type.contains("edit") {
        StepKind::Edit
    } else if item_type.contains("error") {
        StepKind::Error
    } else {
        StepKind::Thinking
    }
}

/// Live run stream: reads body fragments, reassembles lines, decodes them.
pub struct LangflowStream {
    response: reqwest::Response,
    buffer: LineBuffer,
    decoder: LangflowDecoder,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl LangflowStream {
    pub(crate) fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: LineBuffer::new(),
            decoder: LangflowDecoder::new(),
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

/// Kick off a streaming run and hand back the event stream.
pub async fn open_run_stream(
    http: &reqwest::Client,
    config: &ProviderConfig,
    input: &str,
    session_id: &str,
    tweaks: Value,
) -> AppResult<LangflowStream> {
    let response = send_run(http, config, input, session_id, tweaks, true).await?;
    Ok(LangflowStream::new(response))
}

/// One-shot run used for side calls (session titling). Returns the final
/// message text from the run result.
pub async fn run_text(
    http: &reqwest::Client,
    config: &ProviderConfig,
    input: &str,
    session_id: &str,
    timeout: std::time::Duration,
) -> AppResult<String> {
    let response = send_run_with_timeout(http, config, input, session_id, json!({}), false, Some(timeout)).await?;
    let body: Value = response
        .json()
        .await
        .map_err(|e| AppError::Transport(format!("run result was not JSON: {e}")))?;
    body.pointer("/outputs/0/outputs/0/results/message/text")
        .or_else(|| body.pointer("/outputs/0/outputs/0/results/message/data/text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Internal("run result carried no message text".into()))
}

async fn send_run(
    http: &reqwest::Client,
    config: &ProviderConfig,
    input: &str,
    session_id: &str,
    tweaks: Value,
    stream: bool,
) -> AppResult<reqwest::Response> {
    send_run_with_timeout(http, config, input, session_id, tweaks, stream, None).await
}

async fn send_run_with_timeout(
    http: &reqwest::Client,
    config: &ProviderConfig,
    input: &str,
    session_id: &str,
    tweaks: Value,
    stream: bool,
    timeout: Option<std::time::Duration>,
) -> AppResult<reqwest::Response> {
    let flow_id = config
        .flow_id
        .as_deref()
        .ok_or_else(|| AppError::InvalidRequest("no flow id configured".into()))?;
    let mut url = format!(
        "{}/api/v1/run/{}",
        config.base_url.trim_end_matches('/'),
        flow_id
    );
    if stream {
        url.push_str("?stream=true");
    }

    let body = json!({
        "input_value": input,
        "input_type": "chat",
        "output_type": "chat",
        "session_id": session_id,
        "tweaks": tweaks,
    });

    let mut request = http.post(&url).json(&body);
    if let Some(key) = &config.api_key {
        request = request.header("x-api-key", key);
    }
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }

    let response = request
        .send()
        .await
        .map_err(|e| AppError::Transport(format!("run call failed: {e}")))?;
    if !response.status().is_success() {
        return Err(AppError::Transport(format!(
            "run call returned {}",
            response.status()
        )));
    }
    Ok(response)
}

/// Upload one attachment ahead of a run. The returned server-side path is
/// only ever used to fill the run call's tweaks.
pub async fn upload_attachment(
    http: &reqwest::Client,
    config: &ProviderConfig,
    attachment: &Attachment,
) -> AppResult<String> {
    let flow_id = config
        .flow_id
        .as_deref()
        .ok_or_else(|| AppError::InvalidRequest("no flow id configured".into()))?;
    let url = format!(
        "{}/api/v1/files/upload/{}",
        config.base_url.trim_end_matches('/'),
        flow_id
    );

    let bytes = tokio::fs::read(&attachment.path).await?;
    let mut part = reqwest::multipart::Part::bytes(bytes).file_name(attachment.name.clone());
    if let Some(mime) = &attachment.mime_type {
        part = part
            .mime_str(mime)
            .map_err(|e| AppError::InvalidRequest(format!("bad mime type {mime}: {e}")))?;
    }
    let form = reqwest::multipart::Form::new().part("file", part);

    let mut request = http.post(&url).multipart(form);
    if let Some(key) = &config.api_key {
        request = request.header("x-api-key", key);
    }

    let response = request
        .send()
        .await
        .map_err(|e| AppError::Transport(format!("upload failed: {e}")))?;
    if !response.status().is_success() {
        return Err(AppError::Transport(format!(
            "upload returned {}",
            response.status()
        )));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| AppError::Transport(format!("upload result was not JSON: {e}")))?;
    body.get("file_path")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Internal("upload result carried no file_path".into()))
}
