//! Version store: every message is an append-only list of versions plus a
//! denormalized view of the current one.
//!
//! All conversation mutations go through these operations so the version
//! list and the cached `content`/`attachments`/`steps` can never disagree.
//! Versions are only ever appended; superseded versions stay untouched.

use chrono::Utc;

use crate::error::{AppError, AppResult};
use crate::models::message::{Attachment, Message, MessageVersion, ProcessStep, Role};
use crate::models::session::ChatSession;

/// Append a user message opening a new turn. There is no assistant reply yet,
/// so no pairing applies.
pub fn append_user_turn(
    session: &mut ChatSession,
    content: &str,
    attachments: Vec<Attachment>,
) -> String {
    let message = Message::new(
        Role::User,
        uuid::Uuid::new_v4().to_string(),
        content,
        attachments,
    );
    let id = message.id.clone();
    session.messages.push(message);
    session.touch();
    id
}

/// Start an assistant reply and return the message id to stream into.
///
/// With a target id (edit/regenerate) a fresh empty version is appended to
/// that message and made current. Without one a new assistant message is
/// created, sharing the turn id of the most recent user message.
pub fn begin_assistant_turn(session: &mut ChatSession, target: Option<&str>) -> AppResult<String> {
    match target {
        Some(message_id) => {
            let message = session
                .message_mut(message_id)
                .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
            push_empty_version(message);
            let id = message.id.clone();
            session.touch();
            Ok(id)
        }
        None => {
            let turn_id = session
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.turn_id.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let message = Message::new(Role::Assistant, turn_id, "", Vec::new());
            let id = message.id.clone();
            session.messages.push(message);
            session.touch();
            Ok(id)
        }
    }
}

/// Append streamed text to the current version. Empty deltas are a no-op.
pub fn apply_delta(session: &mut ChatSession, message_id: &str, delta: &str) -> AppResult<()> {
    if delta.is_empty() {
        return Ok(());
    }
    let message = session
        .message_mut(message_id)
        .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
    let index = message.current_version;
    message.versions[index].content.push_str(delta);
    message.content.push_str(delta);
    session.touch();
    Ok(())
}

/// Overwrite the current version with an authoritative full text.
pub fn apply_replace(session: &mut ChatSession, message_id: &str, full_text: &str) -> AppResult<()> {
    let message = session
        .message_mut(message_id)
        .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
    let index = message.current_version;
    message.versions[index].content = full_text.to_string();
    message.content = full_text.to_string();
    session.touch();
    Ok(())
}

/// Install the latest step batch. Backends resend the whole list each time,
/// so this replaces rather than appends.
pub fn apply_steps(
    session: &mut ChatSession,
    message_id: &str,
    steps: Vec<ProcessStep>,
) -> AppResult<()> {
    let message = session
        .message_mut(message_id)
        .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
    let index = message.current_version;
    message.versions[index].steps = steps.clone();
    message.steps = steps;
    session.touch();
    Ok(())
}

/// Branch a user message with edited content. When a paired assistant reply
/// exists, a parallel empty version is appended there for the fresh request
/// to fill; its id is returned so the caller can stream into it.
pub fn create_edit_branch(
    session: &mut ChatSession,
    user_message_id: &str,
    new_content: &str,
) -> AppResult<Option<String>> {
    let turn_id = {
        let message = session
            .message_mut(user_message_id)
            .ok_or_else(|| AppError::NotFound(format!("message {user_message_id}")))?;
        if message.role != Role::User {
            return Err(AppError::InvalidRequest("edit targets a user message".into()));
        }
        message.versions.push(MessageVersion {
            content: new_content.to_string(),
            attachments: message.attachments.clone(),
            steps: Vec::new(),
            timestamp: Utc::now(),
        });
        message.current_version = message.versions.len() - 1;
        message.refresh_cache();
        message.turn_id.clone()
    };

    let paired = paired_assistant_id(session, &turn_id);
    if let Some(assistant_id) = &paired {
        // The lookup just produced this id, so the message is present.
        if let Some(assistant) = session.message_mut(assistant_id) {
            push_empty_version(assistant);
        }
    }
    session.touch();
    Ok(paired)
}

/// Branch an assistant reply for regeneration. Only that message is touched.
pub fn create_regen_branch(session: &mut ChatSession, assistant_message_id: &str) -> AppResult<()> {
    let message = session
        .message_mut(assistant_message_id)
        .ok_or_else(|| AppError::NotFound(format!("message {assistant_message_id}")))?;
    if message.role != Role::Assistant {
        return Err(AppError::InvalidRequest(
            "regenerate targets an assistant message".into(),
        ));
    }
    push_empty_version(message);
    session.touch();
    Ok(())
}

/// Move a message to another of its versions. Out-of-range indices are a
/// no-op. A user message drags its paired assistant reply to the same index,
/// but only when that index exists there; otherwise the reply keeps its
/// current version (partial sync).
pub fn navigate_version(
    session: &mut ChatSession,
    message_id: &str,
    new_index: usize,
) -> AppResult<()> {
    let (role, turn_id) = {
        let message = session
            .message_mut(message_id)
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        if new_index >= message.versions.len() {
            return Ok(());
        }
        message.current_version = new_index;
        message.refresh_cache();
        (message.role, message.turn_id.clone())
    };

    if role == Role::User {
        if let Some(assistant_id) = paired_assistant_id(session, &turn_id) {
            if let Some(assistant) = session.message_mut(&assistant_id) {
                if new_index < assistant.versions.len() {
                    assistant.current_version = new_index;
                    assistant.refresh_cache();
                }
            }
        }
    }
    session.touch();
    Ok(())
}

fn paired_assistant_id(session: &ChatSession, turn_id: &str) -> Option<String> {
    session
        .messages
        .iter()
        .find(|m| m.turn_id == turn_id && m.role == Role::Assistant)
        .map(|m| m.id.clone())
}

fn push_empty_version(message: &mut Message) {
    message.versions.push(MessageVersion {
        content: String::new(),
        attachments: Vec::new(),
        steps: Vec::new(),
        timestamp: Utc::now(),
    });
    message.current_version = message.versions.len() - 1;
    message.refresh_cache();
}
