//! Adapter for a host-driven model SDK.
//!
//! The SDK already hands out decoded text chunks, so there is no wire format
//! to parse here. The host forwards each chunk (or the SDK's terminal error)
//! into an mpsc channel; closing the sender ends the turn.

use tokio::sync::mpsc;

use crate::error::AppResult;
use crate::protocol::{DeltaDedup, StreamEvent};

pub struct NativeStream {
    rx: mpsc::Receiver<AppResult<String>>,
    dedup: DeltaDedup,
    finished: bool,
}

impl NativeStream {
    pub fn new(rx: mpsc::Receiver<AppResult<String>>) -> Self {
        Self {
            rx,
            dedup: DeltaDedup::default(),
            finished: false,
        }
    }

    /// A connected (sender, stream) pair for hosts that pump SDK chunks.
    pub fn channel(capacity: usize) -> (mpsc::Sender<AppResult<String>>, NativeStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, NativeStream::new(rx))
    }

    pub async fn next_event(&mut self) -> AppResult<Option<StreamEvent>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.rx.recv().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() || !self.dedup.accept(&chunk) {
                        continue;
                    }
                    return Ok(Some(StreamEvent::TextDelta(chunk)));
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                None => {
                    self.finished = true;
                    return Ok(Some(StreamEvent::Done));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[tokio::test]
    async fn test_chunks_pass_through_then_done() {
        let (tx, mut stream) = NativeStream::channel(8);
        tx.send(Ok("Hello".into())).await.expect("send");
        tx.send(Ok(" world".into())).await.expect("send");
        drop(tx);

        assert_eq!(
            stream.next_event().await.expect("event"),
            Some(StreamEvent::TextDelta("Hello".into()))
        );
        assert_eq!(
            stream.next_event().await.expect("event"),
            Some(StreamEvent::TextDelta(" world".into()))
        );
        assert_eq!(stream.next_event().await.expect("event"), Some(StreamEvent::Done));
        assert_eq!(stream.next_event().await.expect("event"), None);
    }

    #[tokio::test]
    async fn test_repeated_chunk_is_deduped() {
        let (tx, mut stream) = NativeStream::channel(8);
        tx.send(Ok("tok".into())).await.expect("send");
        tx.send(Ok("tok".into())).await.expect("send");
        drop(tx);

        assert_eq!(
            stream.next_event().await.expect("event"),
            Some(StreamEvent::TextDelta("tok".into()))
        );
        assert_eq!(stream.next_event().await.expect("event"), Some(StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_error_ends_the_stream() {
        let (tx, mut stream) = NativeStream::channel(8);
        tx.send(Err(AppError::Transport("connection reset".into())))
            .await
            .expect("send");

        assert!(stream.next_event().await.is_err());
        assert_eq!(stream.next_event().await.expect("event"), None);
    }
}
