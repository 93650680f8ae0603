use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::models::session::ChatSession;
use crate::protocol::native::NativeStream;
use crate::turn::TurnPhase;

pub struct ClientState {
    pub config: Arc<Mutex<ClientConfig>>,
    /// Shared HTTP client; connect timeout only, so open streams can run as
    /// long as the reply takes.
    pub http: reqwest::Client,
    /// All known sessions keyed by session id.
    pub sessions: Arc<Mutex<HashMap<String, ChatSession>>>,
    /// Where the single in-flight request currently is. Client-wide: there is
    /// at most one active turn across all sessions.
    pub phase: Arc<Mutex<TurnPhase>>,
    /// Cancellation token of the in-flight turn, if any.
    pub active_turn: Arc<Mutex<Option<CancellationToken>>>,
    /// Host-connected chunk source consumed by the next native-backend turn.
    pub native_source: Arc<Mutex<Option<NativeStream>>>,
}

impl ClientState {
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config: Arc::new(Mutex::new(config)),
            http,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            phase: Arc::new(Mutex::new(TurnPhase::Idle)),
            active_turn: Arc::new(Mutex::new(None)),
            native_source: Arc::new(Mutex::new(None)),
        }
    }

    /// Create an empty session and return its id.
    pub async fn create_session(&self) -> String {
        let session = ChatSession::new();
        let id = session.id.clone();
        self.sessions.lock().await.insert(id.clone(), session);
        id
    }

    /// Snapshot of one session for rendering. Collaborators re-read after
    /// each applied event; there is no change notification.
    pub async fn session(&self, session_id: &str) -> Option<ChatSession> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Host-level session deletion. The engine itself never removes messages.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.lock().await.remove(session_id).is_some()
    }

    /// Install the chunk source the next native-backend turn will consume.
    pub async fn connect_native(&self, stream: NativeStream) {
        *self.native_source.lock().await = Some(stream);
    }

    pub async fn is_loading(&self) -> bool {
        matches!(*self.phase.lock().await, TurnPhase::Loading)
    }

    pub async fn is_streaming(&self) -> bool {
        matches!(*self.phase.lock().await, TurnPhase::Streaming)
    }

    /// Ask the in-flight turn, if any, to stop consuming its transport. The
    /// turn keeps whatever it accumulated and finalizes normally.
    pub async fn cancel_turn(&self) {
        if let Some(token) = self.active_turn.lock().await.as_ref() {
            token.cancel();
        }
    }
}

// Implement Clone manually to allow state sharing in spawned tasks
impl Clone for ClientState {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            http: self.http.clone(),
            sessions: Arc::clone(&self.sessions),
            phase: Arc::clone(&self.phase),
            active_turn: Arc::clone(&self.active_turn),
            native_source: Arc::clone(&self.native_source),
        }
    }
}
