use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::message::Message;

pub const DEFAULT_TITLE: &str = "New Chat";

/// A single conversation. The engine only ever touches `messages` and
/// `updated_at`; everything else belongs to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.into(),
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub(crate) fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}
