pub mod attachments;
pub mod client;
pub mod message;
pub mod service;

pub use attachments::{
    AttachmentPart, AttachmentResolver, AttachmentSpec, FileSource, InlineFile, LocalFiles,
    Resolution,
};
pub use client::{
    CertificateIssue, CertificatePolicy, ConnectParams, LettreTransport, ServerOptions, SmtpTransport,
    TlsVerification,
};
pub use message::{AssembledMessage, MessageAssembler, MessageSpec};
pub use service::{send_email, EmailSender, SessionState};

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors raised while sending an email
#[derive(Error, Debug)]
pub enum SendEmailError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("The given file path '{pattern}' had no matching files")]
    AttachmentNotFound { pattern: String },

    #[error("Failed to read attachment '{}': {source}", path.display())]
    AttachmentRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Operation was cancelled")]
    OperationCancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SendEmailError {
    /// True when the error came from the caller's cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SendEmailError::OperationCancelled)
    }
}

pub type SendEmailResult<T> = Result<T, SendEmailError>;

/// Transport security for the SMTP session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Plaintext for the whole session
    None,
    /// TLS from the first byte (SMTPS)
    ImplicitTls,
    /// Plaintext greeting, then a mandatory STARTTLS upgrade
    StartTls,
    /// Upgrade with STARTTLS only when the server offers it
    StartTlsIfAvailable,
    /// Pick one of the above from the port
    #[default]
    Auto,
}

impl SecurityMode {
    /// Resolve `Auto` into a concrete mode. Port 465 is SMTPS, everything else
    /// upgrades opportunistically.
    pub fn resolve(self, port: u16) -> SecurityMode {
        match self {
            SecurityMode::Auto if port == 465 => SecurityMode::ImplicitTls,
            SecurityMode::Auto => SecurityMode::StartTlsIfAvailable,
            other => other,
        }
    }
}

/// Credentials presented to the server
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    #[default]
    None,
    UsernamePassword {
        username: String,
        password: String,
    },
    #[serde(rename = "oauth2_token")]
    OAuth2Token {
        username: String,
        token: String,
    },
    /// Use the identity of the running process instead of explicit credentials
    IntegratedWindowsAuth,
}

impl Credential {
    /// Pick the SASL mechanism for this credential, `None` when AUTH is skipped
    pub fn mechanism(&self) -> Option<AuthMechanism> {
        match self {
            Credential::None => None,
            // An empty password means the relay accepts us unauthenticated
            Credential::UsernamePassword { password, .. } if password.is_empty() => None,
            Credential::UsernamePassword { username, password } => Some(AuthMechanism::Login {
                username: username.clone(),
                password: password.clone(),
            }),
            Credential::OAuth2Token { username, token } => Some(AuthMechanism::OAuth2 {
                username: username.clone(),
                token: token.clone(),
            }),
            Credential::IntegratedWindowsAuth => Some(AuthMechanism::Integrated),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::OAuth2Token { username, .. } => f
                .debug_struct("OAuth2Token")
                .field("username", username)
                .field("token", &"<redacted>")
                .finish(),
            Credential::IntegratedWindowsAuth => f.write_str("IntegratedWindowsAuth"),
        }
    }
}

/// SMTP authentication mechanism selected from a [`Credential`]
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMechanism {
    /// AUTH LOGIN with a network credential
    Login { username: String, password: String },
    /// AUTH XOAUTH2 carrying username and bearer token
    OAuth2 { username: String, token: String },
    /// Ambient identity of the calling process
    Integrated,
}

impl AuthMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMechanism::Login { .. } => "LOGIN",
            AuthMechanism::OAuth2 { .. } => "XOAUTH2",
            AuthMechanism::Integrated => "INTEGRATED",
        }
    }
}

impl std::fmt::Debug for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMechanism::Login { username, .. } | AuthMechanism::OAuth2 { username, .. } => {
                write!(f, "{}({})", self.name(), username)
            }
            AuthMechanism::Integrated => f.write_str(self.name()),
        }
    }
}

/// Machine-readable counterpart of [`SendOutcome::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Sent,
    SkippedNoAttachments,
}

/// Result of a send call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub sent: bool,
    pub status: String,
    pub kind: SendStatus,
}

impl SendOutcome {
    pub fn sent_to(to_list: &str) -> Self {
        Self {
            sent: true,
            status: format!("Email sent to: {}", to_list),
            kind: SendStatus::Sent,
        }
    }

    pub fn skipped_no_attachments(pattern: &str) -> Self {
        Self {
            sent: false,
            status: format!(
                "No attachments found matching path '{}'. No email sent.",
                pattern
            ),
            kind: SendStatus::SkippedNoAttachments,
        }
    }
}

/// Race `future` against the cancellation signal. The future is dropped as soon
/// as cancellation is observed, so no further I/O is issued through it.
pub(crate) async fn until_cancelled<T, F>(cancel: &CancellationToken, future: F) -> SendEmailResult<T>
where
    F: Future<Output = SendEmailResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(SendEmailError::OperationCancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SendEmailError::OperationCancelled),
        result = future => result,
    }
}
