use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Workflow-automation server speaking newline-delimited JSON events.
    Langflow,
    /// Any server exposing the OpenAI chat/completions wire shape.
    OpenAi,
    /// A model SDK driven by the host; the engine receives pre-decoded chunks.
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Model id for OpenAI-compatible servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Flow id for workflow-automation servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Tweak key uploaded attachment paths are handed to in the run call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_component: Option<String>,
    /// Use the `/api/v1/responses` surface instead of `/chat/completions`.
    #[serde(default)]
    pub use_responses_api: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Langflow,
            base_url: "http://localhost:7860".into(),
            api_key: None,
            model: None,
            flow_id: None,
            file_component: None,
            use_responses_api: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub provider: ProviderConfig,
    /// Connect timeout for outbound calls. Open streams are not limited by
    /// this; a reply may legitimately take much longer than any one connect.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    15
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("loquax").join("settings.json"))
}

impl ClientConfig {
    /// Read settings from the user config dir. A missing or unreadable file
    /// falls back to defaults so first launch works without any setup.
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!(
                        "[Config] {} is not valid settings JSON ({}), using defaults",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> AppResult<()> {
        let path =
            config_path().ok_or_else(|| AppError::Internal("no user config directory".into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
