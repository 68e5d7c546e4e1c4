use crate::smtp::{AttachmentSpec, MessageSpec, SendEmailError, SendEmailResult, ServerOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything needed for one send, as read from a request file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmailRequest {
    pub message: MessageSpec,
    #[serde(default)]
    pub attachments: Vec<AttachmentSpec>,
    #[serde(default)]
    pub server: ServerOptions,
}

impl SendEmailRequest {
    /// Load a request from a TOML file
    pub async fn load_from_file(path: &Path) -> SendEmailResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SendEmailError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> SendEmailResult<Self> {
        toml::from_str(content)
            .map_err(|e| SendEmailError::Config(format!("Failed to parse request: {}", e)))
    }

    pub fn to_toml_string(&self) -> SendEmailResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SendEmailError::Config(format!("Failed to serialize request: {}", e)))
    }
}
