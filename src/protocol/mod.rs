pub mod langflow;
pub mod native;
pub mod openai;

use crate::error::AppResult;
use crate::models::message::ProcessStep;

/// One normalized unit of backend output. Adapters translate their wire
/// format into this; nothing downstream knows which backend is speaking.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text to append to the in-progress version.
    TextDelta(String),
    /// Authoritative full text that overrides everything accumulated so far.
    TextReplace(String),
    /// The latest full batch of intermediate steps (replaces prior batches).
    Steps(Vec<ProcessStep>),
    /// Explicit end of turn.
    Done,
}

/// Reassembles logical lines from arbitrary transport fragments.
///
/// The transport may split a line across deliveries, so fragments accumulate
/// until a newline arrives; the trailing partial line is carried forward.
/// Splitting on the newline byte before decoding keeps multi-byte characters
/// intact even when a fragment boundary lands inside one.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fragment and get back every line it completed.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(fragment);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Hand out whatever is still buffered once the transport has closed.
    /// Some servers do not terminate their final frame with a newline.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}

/// Drops a text delta that is byte-identical to the one emitted immediately
/// before it. Backends have been seen re-sending the same token frame twice;
/// only the most recent delta is compared, never the full history.
#[derive(Debug, Default)]
pub struct DeltaDedup {
    last: Option<String>,
}

impl DeltaDedup {
    pub fn accept(&mut self, text: &str) -> bool {
        if self.last.as_deref() == Some(text) {
            return false;
        }
        self.last = Some(text.to_string());
        true
    }
}

/// The event sequence for one conversational turn: lazy, finite and
/// non-restartable. `Ok(None)` means the stream is exhausted.
pub enum TurnStream {
    Langflow(langflow::LangflowStream),
    OpenAi(openai::OpenAiStream),
    Native(native::NativeStream),
}

impl TurnStream {
    pub async fn next_event(&mut self) -> AppResult<Option<StreamEvent>> {
        match self {
            TurnStream::Langflow(stream) => stream.next_event().await,
            TurnStream::OpenAi(stream) => stream.next_event().await,
            TurnStream::Native(stream) => stream.next_event().await,
        }
    }
}
