//! Request orchestrator: drives one conversational turn end-to-end.
//!
//! A turn moves Idle -> Loading -> Streaming -> Finalizing -> Idle. Failures
//! route through the same Finalizing step, so loading indicators are cleared
//! exactly once per request no matter how it ended. Events are pulled from
//! the adapter strictly one at a time and applied in order.

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{AppError, AppResult};
use crate::models::message::{Attachment, Role};
use crate::models::session::{ChatSession, DEFAULT_TITLE};
use crate::protocol::{langflow, openai, StreamEvent, TurnStream};
use crate::state::ClientState;
use crate::store;

/// Where the single in-flight request currently is. One value, one owner;
/// `is_loading`/`is_streaming` are derived views so call sites cannot let a
/// pair of booleans drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Loading,
    Streaming,
    Finalizing,
}

#[derive(Debug, Clone)]
pub enum TurnAction {
    Send {
        session_id: String,
        content: String,
        attachments: Vec<Attachment>,
    },
    Edit {
        session_id: String,
        message_id: String,
        content: String,
    },
    Regenerate {
        session_id: String,
        message_id: String,
    },
}

impl TurnAction {
    pub fn session_id(&self) -> &str {
        match self {
            TurnAction::Send { session_id, .. }
            | TurnAction::Edit { session_id, .. }
            | TurnAction::Regenerate { session_id, .. } => session_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TurnAction::Send { .. } => "send",
            TurnAction::Edit { .. } => "edit",
            TurnAction::Regenerate { .. } => "regenerate",
        }
    }
}

pub const GENERIC_ERROR_NOTICE: &str =
    "Something went wrong while generating this response. Please try again.";
pub const QUOTA_ERROR_NOTICE: &str =
    "The provider's usage quota is exhausted. Check your plan and billing, then try again later.";

const TITLE_TIMEOUT: Duration = Duration::from_secs(10);
const TITLE_PROMPT: &str =
    "Reply with a title of at most five words for this conversation. No quotes, no trailing punctuation.";

/// Run one turn to completion and return the assistant message id, when one
/// was created. Failed turns come back `Ok` too: the failure is delivered as
/// a notice inside the reply, not as an error to the caller. `Err` is
/// reserved for requests rejected at the door (busy client, unknown session
/// or message).
pub async fn run_turn(state: &ClientState, action: TurnAction) -> AppResult<Option<String>> {
    {
        let mut phase = state.phase.lock().await;
        if *phase != TurnPhase::Idle {
            return Err(AppError::Busy("another turn is in flight".into()));
        }
        *phase = TurnPhase::Loading;
    }

    let cancel = CancellationToken::new();
    *state.active_turn.lock().await = Some(cancel.clone());

    let session_id = action.session_id().to_string();
    log::info!("[Turn:{}] {} started", session_id, action.name());

    let outcome = drive_turn(state, &session_id, &action, &cancel).await;
    let result = match outcome {
        Ok(target) => Ok(target),
        Err(TurnFailure { error, target }) => {
            log::error!("[Turn:{session_id}] failed: {error}");
            append_failure_notice(state, &session_id, target, &error).await
        }
    };

    finalize_turn(state, &session_id).await;
    result
}

struct TurnFailure {
    error: AppError,
    /// The reply being streamed into when the failure hit, if one existed.
    target: Option<String>,
}

struct PreparedTurn {
    /// Message id to stream into; `None` until the first event creates one.
    target: Option<String>,
    /// The user text driving the request.
    input: String,
    /// Chat-shaped history for backends that want the whole conversation.
    history: Vec<Value>,
    attachments: Vec<Attachment>,
}

async fn drive_turn(
    state: &ClientState,
    session_id: &str,
    action: &TurnAction,
    cancel: &CancellationToken,
) -> Result<Option<String>, TurnFailure> {
    let prepared = prepare_turn(state, action).await.map_err(|error| TurnFailure {
        error,
        target: None,
    })?;
    let target = prepared.target.clone();
    let mut stream = open_stream(state, session_id, &prepared)
        .await
        .map_err(|error| TurnFailure {
            error,
            target: target.clone(),
        })?;
    pump_stream(state, session_id, target, &mut stream, cancel).await
}

/// Apply the branch mutations for this action and gather what the outbound
/// call needs. Runs before any network traffic, so an edited or regenerated
/// message shows its reset state while the request is still connecting.
async fn prepare_turn(state: &ClientState, action: &TurnAction) -> AppResult<PreparedTurn> {
    let mut sessions = state.sessions.lock().await;
    match action {
        TurnAction::Send {
            session_id,
            content,
            attachments,
        } => {
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
            store::append_user_turn(session, content, attachments.clone());
            Ok(PreparedTurn {
                target: None,
                input: content.clone(),
                history: collect_history(session, None),
                attachments: attachments.clone(),
            })
        }
        TurnAction::Edit {
            session_id,
            message_id,
            content,
        } => {
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
            let target = store::create_edit_branch(session, message_id, content)?;
            let turn_id = session.message(message_id).map(|m| m.turn_id.clone());
            Ok(PreparedTurn {
                target,
                input: content.clone(),
                history: collect_history(session, turn_id.as_deref()),
                attachments: Vec::new(),
            })
        }
        TurnAction::Regenerate {
            session_id,
            message_id,
        } => {
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
            let turn_id = {
                let message = session
                    .message(message_id)
                    .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
                if message.role != Role::Assistant {
                    return Err(AppError::InvalidRequest(
                        "regenerate targets an assistant message".into(),
                    ));
                }
                message.turn_id.clone()
            };
            let input = session
                .messages
                .iter()
                .find(|m| m.turn_id == turn_id && m.role == Role::User)
                .map(|m| m.content.clone())
                .ok_or_else(|| {
                    AppError::InvalidRequest("reply has no user prompt to regenerate from".into())
                })?;
            store::create_regen_branch(session, message_id)?;
            Ok(PreparedTurn {
                target: Some(message_id.clone()),
                input,
                history: collect_history(session, Some(&turn_id)),
                attachments: Vec::new(),
            })
        }
    }
}

/// History up to (and including) the driving user turn, skipping messages
/// with nothing to say — most importantly the empty version just branched
/// for the reply being regenerated.
fn collect_history(session: &ChatSession, upto_turn: Option<&str>) -> Vec<Value> {
    let mut history = Vec::new();
    for message in &session.messages {
        if !message.content.is_empty() {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            history.push(json!({ "role": role, "content": message.content }));
        }
        if let Some(turn_id) = upto_turn {
            if message.turn_id == turn_id && message.role == Role::User {
                break;
            }
        }
    }
    history
}

async fn open_stream(
    state: &ClientState,
    session_id: &str,
    prepared: &PreparedTurn,
) -> AppResult<TurnStream> {
    let config = state.config.lock().await.provider.clone();
    match config.kind {
        ProviderKind::Langflow => {
            let tweaks = build_tweaks(state, &config, &prepared.attachments).await?;
            let stream = langflow::open_run_stream(
                &state.http,
                &config,
                &prepared.input,
                session_id,
                tweaks,
            )
            .await?;
            Ok(TurnStream::Langflow(stream))
        }
        ProviderKind::OpenAi => {
            let stream =
                openai::open_chat_stream(&state.http, &config, prepared.history.clone()).await?;
            Ok(TurnStream::OpenAi(stream))
        }
        ProviderKind::Native => state
            .native_source
            .lock()
            .await
            .take()
            .map(TurnStream::Native)
            .ok_or_else(|| AppError::InvalidRequest("no native stream connected".into())),
    }
}

/// Upload attachments and fold the returned server-side paths into the run
/// call's tweaks. The paths are used nowhere else.
async fn build_tweaks(
    state: &ClientState,
    config: &ProviderConfig,
    attachments: &[Attachment],
) -> AppResult<Value> {
    if attachments.is_empty() {
        return Ok(json!({}));
    }
    let mut paths = Vec::new();
    for attachment in attachments {
        let remote = langflow::upload_attachment(&state.http, config, attachment).await?;
        log::debug!("[Turn] uploaded {} -> {}", attachment.name, remote);
        paths.push(remote);
    }
    let component = config.file_component.as_deref().unwrap_or("File");
    Ok(json!({ component: { "path": paths } }))
}

/// Pull events one at a time and apply each before requesting the next.
async fn pump_stream(
    state: &ClientState,
    session_id: &str,
    mut target: Option<String>,
    stream: &mut TurnStream,
    cancel: &CancellationToken,
) -> Result<Option<String>, TurnFailure> {
    let mut saw_event = false;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("[Turn:{session_id}] cancelled; keeping accumulated text");
                break;
            }
            next = stream.next_event() => next,
        };
        match next {
            Ok(Some(event)) => {
                if !saw_event {
                    saw_event = true;
                    *state.phase.lock().await = TurnPhase::Streaming;
                }
                let done = event == StreamEvent::Done;
                if let Err(error) = apply_event(state, session_id, &mut target, event).await {
                    return Err(TurnFailure { error, target });
                }
                if done {
                    break;
                }
            }
            Ok(None) => {
                // Transport closed without an explicit end event; finalize
                // with whatever accumulated.
                log::debug!("[Turn:{session_id}] stream ended without an end event");
                break;
            }
            Err(error) => return Err(TurnFailure { error, target }),
        }
    }
    Ok(target)
}

/// Apply one normalized event to the session. The reply shell is created
/// here, at the first event of any kind, so the host keeps showing its
/// loading state until there is something to render.
pub(crate) async fn apply_event(
    state: &ClientState,
    session_id: &str,
    target: &mut Option<String>,
    event: StreamEvent,
) -> AppResult<()> {
    let mut sessions = state.sessions.lock().await;
    let session = sessions
        .get_mut(session_id)
        .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
    let message_id = match target.as_ref() {
        Some(id) => id.clone(),
        None => {
            let id = store::begin_assistant_turn(session, None)?;
            *target = Some(id.clone());
            id
        }
    };
    match event {
        StreamEvent::TextDelta(text) => store::apply_delta(session, &message_id, &text),
        StreamEvent::TextReplace(text) => {
            let unchanged = session
                .message(&message_id)
                .map(|m| m.content == text)
                .unwrap_or(false);
            if unchanged {
                // Identical replacement: leave the text alone so nothing
                // re-renders.
                Ok(())
            } else {
                store::apply_replace(session, &message_id, &text)
            }
        }
        StreamEvent::Steps(steps) => store::apply_steps(session, &message_id, steps),
        StreamEvent::Done => Ok(()),
    }
}

/// Turn a failure into a terminal, user-visible message. Quota exhaustion
/// gets its own wording; everything else the generic notice. Partial text
/// that already streamed in stays put, with the notice appended after it.
async fn append_failure_notice(
    state: &ClientState,
    session_id: &str,
    target: Option<String>,
    error: &AppError,
) -> AppResult<Option<String>> {
    let notice = if is_quota_error(&error.to_string()) {
        QUOTA_ERROR_NOTICE
    } else {
        GENERIC_ERROR_NOTICE
    };

    let mut sessions = state.sessions.lock().await;
    let session = sessions
        .get_mut(session_id)
        .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
    let message_id = match target {
        Some(id) => id,
        None => store::begin_assistant_turn(session, None)?,
    };
    let has_text = session
        .message(&message_id)
        .map(|m| !m.content.is_empty())
        .unwrap_or(false);
    let text = if has_text {
        format!("\n\n{notice}")
    } else {
        notice.to_string()
    };
    store::apply_delta(session, &message_id, &text)?;
    Ok(Some(message_id))
}

fn is_quota_error(message: &str) -> bool {
    message.contains("429")
        || message.to_ascii_lowercase().contains("quota")
        || message.contains("RESOURCE_EXHAUSTED")
}

/// Always the last step of a turn, success or not: bump the session, name it
/// if it is brand new, clear the loading indicators exactly once.
async fn finalize_turn(state: &ClientState, session_id: &str) {
    *state.phase.lock().await = TurnPhase::Finalizing;

    maybe_name_session(state, session_id).await;

    if let Some(session) = state.sessions.lock().await.get_mut(session_id) {
        session.touch();
    }

    *state.active_turn.lock().await = None;
    *state.phase.lock().await = TurnPhase::Idle;
    log::debug!("[Turn:{session_id}] finalized");
}

/// Best-effort naming for a brand-new session. Any failure falls back to
/// truncating the first user message; the main turn is never affected.
async fn maybe_name_session(state: &ClientState, session_id: &str) {
    let seed = {
        let sessions = state.sessions.lock().await;
        match sessions.get(session_id) {
            Some(session) if session.title == DEFAULT_TITLE => session
                .messages
                .iter()
                .find(|m| m.role == Role::User && !m.content.is_empty())
                .map(|m| m.content.clone()),
            _ => None,
        }
    };
    let Some(seed) = seed else { return };

    let config = state.config.lock().await.provider.clone();
    let title = match request_title(&state.http, &config, &seed).await {
        Ok(title) if !title.trim().is_empty() => title.trim().to_string(),
        Ok(_) => fallback_title(&seed),
        Err(e) => {
            log::debug!("[Turn:{session_id}] title call failed ({e}), using truncation");
            fallback_title(&seed)
        }
    };

    if let Some(session) = state.sessions.lock().await.get_mut(session_id) {
        session.title = title;
    }
}

async fn request_title(
    http: &reqwest::Client,
    config: &ProviderConfig,
    seed: &str,
) -> AppResult<String> {
    match config.kind {
        ProviderKind::OpenAi => {
            openai::chat_once(
                http,
                config,
                vec![
                    json!({ "role": "system", "content": TITLE_PROMPT }),
                    json!({ "role": "user", "content": seed }),
                ],
                TITLE_TIMEOUT,
            )
            .await
        }
        ProviderKind::Langflow => {
            langflow::run_text(
                http,
                config,
                &format!("{TITLE_PROMPT}\n\n{seed}"),
                &uuid::Uuid::new_v4().to_string(),
                TITLE_TIMEOUT,
            )
            .await
        }
        ProviderKind::Native => Err(AppError::InvalidRequest(
            "native backend has no side channel".into(),
        )),
    }
}

/// Word-boundary truncation of the first prompt, used whenever the title
/// side call cannot deliver.
pub(crate) fn fallback_title(seed: &str) -> String {
    const MAX_CHARS: usize = 40;
    let flat = seed.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.is_empty() {
        return DEFAULT_TITLE.into();
    }
    if flat.chars().count() <= MAX_CHARS {
        return flat;
    }
    let mut title = String::new();
    for word in flat.split(' ') {
        let extra = word.chars().count() + usize::from(!title.is_empty());
        if title.chars().count() + extra > MAX_CHARS {
            break;
        }
        if !title.is_empty() {
            title.push(' ');
        }
        title.push_str(word);
    }
    if title.is_empty() {
        title = flat.chars().take(MAX_CHARS).collect();
    }
    title.push('…');
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::protocol::langflow::LangflowDecoder;
    use crate::protocol::native::NativeStream;

    fn native_state() -> ClientState {
        let mut config = ClientConfig::default();
        config.provider.kind = ProviderKind::Native;
        ClientState::new(config)
    }

    async fn connect_script(state: &ClientState, chunks: Vec<AppResult<String>>) {
        let (tx, stream) = NativeStream::channel(chunks.len().max(1));
        for chunk in chunks {
            tx.send(chunk).await.expect("script chunk");
        }
        drop(tx);
        state.connect_native(stream).await;
    }

    fn send_action(session_id: &str, content: &str) -> TurnAction {
        TurnAction::Send {
            session_id: session_id.into(),
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_deltas_concatenate_in_order() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;
        connect_script(&state, vec![Ok("Hello".into()), Ok(" world".into())]).await;

        let reply = run_turn(&state, send_action(&session_id, "hi"))
            .await?
            .expect("reply created");

        let session = state.session(&session_id).await.expect("session");
        assert_eq!(session.message(&reply).expect("reply").content, "Hello world");
        assert_eq!(session.messages.len(), 2);
        assert!(!state.is_loading().await);
        assert!(!state.is_streaming().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_transport_failure_appends_generic_notice() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;
        connect_script(
            &state,
            vec![
                Ok("Partial answ".into()),
                Err(AppError::Transport("connection reset by peer".into())),
            ],
        )
        .await;

        let reply = run_turn(&state, send_action(&session_id, "hi"))
            .await?
            .expect("reply created");

        let session = state.session(&session_id).await.expect("session");
        let content = &session.message(&reply).expect("reply").content;
        assert_eq!(content, &format!("Partial answ\n\n{GENERIC_ERROR_NOTICE}"));
        assert!(!state.is_loading().await);
        assert!(!state.is_streaming().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_quota_failure_gets_its_own_notice() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;
        connect_script(
            &state,
            vec![Err(AppError::Transport("run call returned 429 Too Many Requests".into()))],
        )
        .await;

        let reply = run_turn(&state, send_action(&session_id, "hi"))
            .await?
            .expect("reply created even without content");

        let session = state.session(&session_id).await.expect("session");
        let content = &session.message(&reply).expect("reply").content;
        assert_eq!(content, QUOTA_ERROR_NOTICE);
        assert_ne!(content, GENERIC_ERROR_NOTICE);
        Ok(())
    }

    #[test]
    fn test_quota_heuristic() {
        assert!(is_quota_error("HTTP 429"));
        assert!(is_quota_error("Quota exceeded for this project"));
        assert!(is_quota_error("status: RESOURCE_EXHAUSTED"));
        assert!(!is_quota_error("connection refused"));
    }

    #[tokio::test]
    async fn test_busy_client_rejects_new_turns() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;
        *state.phase.lock().await = TurnPhase::Loading;

        let result = run_turn(&state, send_action(&session_id, "hi")).await;
        assert!(matches!(result, Err(AppError::Busy(_))));

        // the rejected call must not have cleared the in-flight phase
        assert!(state.is_loading().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_workflow_transcript_replace_wins() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;
        {
            let mut sessions = state.sessions.lock().await;
            let session = sessions.get_mut(&session_id).expect("session");
            store::append_user_turn(session, "greet me", Vec::new());
        }

        let mut decoder = LangflowDecoder::new();
        let mut target = None;
        for line in [
            r#"{"event":"token","data":{"chunk":"Hello"}}"#,
            r#"{"event":"token","data":{"chunk":" world"}}"#,
        ] {
            for event in decoder.decode_line(line) {
                apply_event(&state, &session_id, &mut target, event).await?;
            }
        }
        let reply = target.clone().expect("reply created at first event");
        {
            let session = state.session(&session_id).await.expect("session");
            assert_eq!(session.message(&reply).expect("reply").content, "Hello world");
        }

        for event in decoder
            .decode_line(r#"{"event":"end","data":{"result":{"message":{"text":"Hello world!!!"}}}}"#)
        {
            apply_event(&state, &session_id, &mut target, event).await?;
        }
        let session = state.session(&session_id).await.expect("session");
        let message = session.message(&reply).expect("reply");
        assert_eq!(message.content, "Hello world!!!");
        assert_eq!(message.versions.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_identical_replace_is_a_noop() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;
        let mut target = None;
        apply_event(
            &state,
            &session_id,
            &mut target,
            StreamEvent::TextDelta("same text".into()),
        )
        .await?;
        apply_event(
            &state,
            &session_id,
            &mut target,
            StreamEvent::TextReplace("same text".into()),
        )
        .await?;

        let reply = target.expect("reply");
        let session = state.session(&session_id).await.expect("session");
        assert_eq!(session.message(&reply).expect("reply").content, "same text");
        Ok(())
    }

    #[tokio::test]
    async fn test_edit_streams_into_parallel_branch() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;

        connect_script(&state, vec![Ok("first answer".into())]).await;
        run_turn(&state, send_action(&session_id, "question")).await?;

        let user_id = {
            let session = state.session(&session_id).await.expect("session");
            session
                .messages
                .iter()
                .find(|m| m.role == Role::User)
                .expect("user message")
                .id
                .clone()
        };

        connect_script(&state, vec![Ok("second answer".into())]).await;
        let reply = run_turn(
            &state,
            TurnAction::Edit {
                session_id: session_id.clone(),
                message_id: user_id.clone(),
                content: "revised question".into(),
            },
        )
        .await?
        .expect("paired reply");

        let session = state.session(&session_id).await.expect("session");
        let user = session.message(&user_id).expect("user");
        let assistant = session.message(&reply).expect("assistant");
        assert_eq!(user.versions.len(), 2);
        assert_eq!(assistant.versions.len(), 2);
        assert_eq!(user.content, "revised question");
        assert_eq!(assistant.content, "second answer");
        assert_eq!(assistant.versions[0].content, "first answer");
        Ok(())
    }

    #[tokio::test]
    async fn test_regenerate_leaves_user_versions_alone() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;

        connect_script(&state, vec![Ok("take one".into())]).await;
        let reply = run_turn(&state, send_action(&session_id, "question"))
            .await?
            .expect("reply");

        connect_script(&state, vec![Ok("take two".into())]).await;
        run_turn(
            &state,
            TurnAction::Regenerate {
                session_id: session_id.clone(),
                message_id: reply.clone(),
            },
        )
        .await?;

        let session = state.session(&session_id).await.expect("session");
        let user = session
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .expect("user");
        let assistant = session.message(&reply).expect("assistant");
        assert_eq!(user.versions.len(), 1);
        assert_eq!(assistant.versions.len(), 2);
        assert_eq!(assistant.content, "take two");
        assert_eq!(assistant.versions[0].content, "take one");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_keeps_accumulated_text() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;
        let (tx, stream) = NativeStream::channel(8);
        state.connect_native(stream).await;

        let task = {
            let state = state.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move { run_turn(&state, send_action(&session_id, "hi")).await })
        };

        tx.send(Ok("Hello".into())).await.expect("send");
        // wait for the delta to land before cancelling
        for _ in 0..100 {
            let applied = state
                .session(&session_id)
                .await
                .map(|s| s.messages.iter().any(|m| m.content == "Hello"))
                .unwrap_or(false);
            if applied {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        state.cancel_turn().await;
        let reply = task.await?.map_err(anyhow::Error::from)?.expect("reply");

        let session = state.session(&session_id).await.expect("session");
        assert_eq!(session.message(&reply).expect("reply").content, "Hello");
        assert!(!state.is_loading().await);
        assert!(!state.is_streaming().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_stream_still_creates_reply_shell() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;
        // a closed channel yields only the end-of-stream Done event, and the
        // first event of any kind materializes the reply
        connect_script(&state, Vec::new()).await;

        let reply = run_turn(&state, send_action(&session_id, "hi")).await?;
        let session = state.session(&session_id).await.expect("session");
        assert_eq!(session.messages.len(), 2);
        assert!(reply.is_some());
        assert!(!state.is_loading().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_new_session_gets_fallback_title() -> anyhow::Result<()> {
        let state = native_state();
        let session_id = state.create_session().await;
        connect_script(&state, vec![Ok("sure".into())]).await;

        run_turn(&state, send_action(&session_id, "What is borrow checking?")).await?;
        let session = state.session(&session_id).await.expect("session");
        assert_eq!(session.title, "What is borrow checking?");
        Ok(())
    }

    #[test]
    fn test_fallback_title_truncates_on_word_boundary() {
        assert_eq!(fallback_title("short prompt"), "short prompt");
        let long = "explain the difference between owned and borrowed values in detail please";
        let title = fallback_title(long);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= 41);
        assert!(!title.contains("please"));
        assert_eq!(fallback_title("  \n "), DEFAULT_TITLE);
    }
}
