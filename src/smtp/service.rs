use crate::smtp::{
    until_cancelled, AttachmentResolver, AttachmentSpec, AuthMechanism, ConnectParams, FileSource,
    LettreTransport, LocalFiles, MessageAssembler, MessageSpec, Resolution, SendEmailError,
    SendEmailResult, SendOutcome, ServerOptions, SmtpTransport,
};
use lettre::Message;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Progress of one SMTP session. Sessions only move forward; any error jumps
/// straight to `Disconnecting` and then `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    SkipAuth,
    Sending,
    Disconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::SkipAuth => "skip-auth",
            SessionState::Sending => "sending",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Drives a transport through a single session and guarantees it is released
struct Session<'a, T: SmtpTransport> {
    transport: &'a mut T,
    state: SessionState,
}

impl<'a, T: SmtpTransport> Session<'a, T> {
    fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            state: SessionState::Idle,
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("SMTP session {} -> {}", self.state, next);
        self.state = next;
    }

    async fn run(
        &mut self,
        params: &ConnectParams,
        mechanism: Option<&AuthMechanism>,
        message: &Message,
        cancel: &CancellationToken,
    ) -> SendEmailResult<()> {
        self.transition(SessionState::Connecting);
        until_cancelled(cancel, self.transport.connect(params)).await?;

        match mechanism {
            Some(mechanism) => {
                self.transition(SessionState::Authenticating);
                tracing::debug!("Authenticating with {:?}", mechanism);
                until_cancelled(cancel, self.transport.authenticate(mechanism)).await?;
            }
            None => self.transition(SessionState::SkipAuth),
        }

        self.transition(SessionState::Sending);
        until_cancelled(cancel, self.transport.send(message)).await
    }

    /// Release the session. Only issues a disconnect when a connection was
    /// attempted. Disconnect errors are logged and dropped.
    async fn close(&mut self, graceful: bool) {
        if self.state != SessionState::Idle {
            self.transition(SessionState::Disconnecting);
            if let Err(e) = self.transport.disconnect(graceful).await {
                tracing::warn!("Failed to disconnect from SMTP server: {}", e);
            }
        }
        self.transition(SessionState::Closed);
    }
}

/// Sends one email per call: assemble, resolve attachments, then drive the
/// transport through a single session
pub struct EmailSender<F = LocalFiles> {
    resolver: AttachmentResolver<F>,
}

impl EmailSender<LocalFiles> {
    pub fn new() -> Self {
        Self {
            resolver: AttachmentResolver::new(),
        }
    }
}

impl Default for EmailSender<LocalFiles> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FileSource> EmailSender<F> {
    /// Resolve file-glob attachments through `files` instead of the local disk
    pub fn with_source(files: F) -> Self {
        Self {
            resolver: AttachmentResolver::with_source(files),
        }
    }

    pub async fn send<T: SmtpTransport>(
        &self,
        transport: &mut T,
        message: &MessageSpec,
        attachments: &[AttachmentSpec],
        server: &ServerOptions,
        cancel: &CancellationToken,
    ) -> SendEmailResult<SendOutcome> {
        if cancel.is_cancelled() {
            return Err(SendEmailError::OperationCancelled);
        }

        let assembled = MessageAssembler::assemble(message)?;
        let params = server.connect_params()?;
        let mechanism = server.credential.mechanism();

        let parts = match self.resolver.resolve(attachments, cancel).await? {
            Resolution::Parts(parts) => parts,
            Resolution::SkipSend { pattern } => {
                return Ok(SendOutcome::skipped_no_attachments(&pattern));
            }
        };

        let attachment_count = parts.len();
        let to_list = assembled.to_list();
        let recipients = assembled.recipient_count();
        let email = assembled.into_message(parts)?;

        let mut session = Session::new(transport);
        let result = session.run(&params, mechanism.as_ref(), &email, cancel).await;

        // No QUIT once the caller has cancelled
        let graceful = !matches!(result, Err(SendEmailError::OperationCancelled));
        session.close(graceful).await;

        match result {
            Ok(()) => {
                tracing::info!(
                    "Email sent via {}:{} to {} recipient(s) with {} attachment(s)",
                    params.host,
                    params.port,
                    recipients,
                    attachment_count
                );
                Ok(SendOutcome::sent_to(&to_list))
            }
            Err(e) => {
                tracing::error!("Failed to send email via {}:{}: {}", params.host, params.port, e);
                Err(e)
            }
        }
    }
}

/// Send one email over a fresh lettre SMTP session, reading attachments from
/// the local filesystem
pub async fn send_email(
    message: &MessageSpec,
    attachments: &[AttachmentSpec],
    server: &ServerOptions,
    cancel: &CancellationToken,
) -> SendEmailResult<SendOutcome> {
    let mut transport = LettreTransport::new();
    EmailSender::new()
        .send(&mut transport, message, attachments, server, cancel)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Records calls and fails on the configured step
    #[derive(Default)]
    struct ScriptedTransport {
        calls: Vec<&'static str>,
        fail_connect: bool,
        fail_disconnect: bool,
    }

    #[async_trait]
    impl SmtpTransport for ScriptedTransport {
        async fn connect(&mut self, _params: &ConnectParams) -> SendEmailResult<()> {
            self.calls.push("connect");
            if self.fail_connect {
                return Err(SendEmailError::TransportFailure("connection refused".to_string()));
            }
            Ok(())
        }

        async fn authenticate(&mut self, _mechanism: &AuthMechanism) -> SendEmailResult<()> {
            self.calls.push("authenticate");
            Ok(())
        }

        async fn send(&mut self, _message: &Message) -> SendEmailResult<()> {
            self.calls.push("send");
            Ok(())
        }

        async fn disconnect(&mut self, graceful: bool) -> SendEmailResult<()> {
            self.calls.push(if graceful { "quit" } else { "drop" });
            if self.fail_disconnect {
                return Err(SendEmailError::TransportFailure("socket closed".to_string()));
            }
            Ok(())
        }
    }

    fn message() -> MessageSpec {
        MessageSpec::new("a@x.com", "b@x.com", "Subject", "Body")
    }

    fn server() -> ServerOptions {
        ServerOptions::new("smtp.example.com", 25)
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::SkipAuth.to_string(), "skip-auth");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }

    #[tokio::test]
    async fn test_send_without_credential_skips_auth() {
        let mut transport = ScriptedTransport::default();
        let outcome = EmailSender::new()
            .send(&mut transport, &message(), &[], &server(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.sent);
        assert_eq!(transport.calls, vec!["connect", "send", "quit"]);
    }

    #[tokio::test]
    async fn test_connect_failure_still_disconnects() {
        let mut transport = ScriptedTransport {
            fail_connect: true,
            ..Default::default()
        };
        let err = EmailSender::new()
            .send(&mut transport, &message(), &[], &server(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SendEmailError::TransportFailure(_)));
        assert_eq!(transport.calls, vec!["connect", "quit"]);
    }

    #[tokio::test]
    async fn test_disconnect_error_is_swallowed() {
        let mut transport = ScriptedTransport {
            fail_disconnect: true,
            ..Default::default()
        };
        let outcome = EmailSender::new()
            .send(&mut transport, &message(), &[], &server(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.sent);
    }

    #[tokio::test]
    async fn test_invalid_server_fails_before_connecting() {
        let mut transport = ScriptedTransport::default();
        let err = EmailSender::new()
            .send(
                &mut transport,
                &message(),
                &[],
                &ServerOptions::new("", 25),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SendEmailError::InvalidArgument(_)));
        assert!(transport.calls.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut transport = ScriptedTransport::default();

        let err = EmailSender::new()
            .send(&mut transport, &message(), &[], &server(), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(transport.calls.is_empty());
    }
}
