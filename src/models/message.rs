use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Category of an intermediate step surfaced while a reply was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thinking,
    Command,
    Edit,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStep {
    pub kind: StepKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    /// Local path the user picked; uploads read from here.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One entry in a message's edit/regenerate history. Versions are append-only:
/// once a newer version exists, older ones are never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageVersion {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub steps: Vec<ProcessStep>,
    pub timestamp: DateTime<Utc>,
}

/// A chat message together with its full version history.
///
/// `content`, `attachments` and `steps` mirror `versions[current_version]` so
/// renderers never index into the history themselves. Every mutation goes
/// through the store operations, which keep the mirror and the history in step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Shared by a user message and its assistant reply. Pairing is resolved
    /// by turn id, never by position in the message list.
    pub turn_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub steps: Vec<ProcessStep>,
    pub versions: Vec<MessageVersion>,
    pub current_version: usize,
}

impl Message {
    pub fn new(role: Role, turn_id: String, content: &str, attachments: Vec<Attachment>) -> Self {
        let version = MessageVersion {
            content: content.to_string(),
            attachments: attachments.clone(),
            steps: Vec::new(),
            timestamp: Utc::now(),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turn_id,
            role,
            content: content.to_string(),
            attachments,
            steps: Vec::new(),
            versions: vec![version],
            current_version: 0,
        }
    }

    pub fn current(&self) -> &MessageVersion {
        &self.versions[self.current_version]
    }

    /// Re-copy the current version into the denormalized fields.
    pub(crate) fn refresh_cache(&mut self) {
        let version = self.versions[self.current_version].clone();
        self.content = version.content;
        self.attachments = version.attachments;
        self.steps = version.steps;
    }
}
