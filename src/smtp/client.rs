use crate::smtp::{AuthMechanism, Credential, SecurityMode, SendEmailError, SendEmailResult};
use async_trait::async_trait;
use lettre::{
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{AsyncSmtpConnection, TlsParameters},
        extension::ClientId,
    },
    Message,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SMTP server options supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub security_mode: SecurityMode,
    pub credential: Credential,
    /// Skip certificate chain, name and presence checks. Only for test servers.
    pub accept_all_certificates: bool,
    /// Connect and per-command timeout
    pub timeout_secs: u64,
    /// Name sent in EHLO
    pub hello_name: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 25,
            security_mode: SecurityMode::Auto,
            credential: Credential::None,
            accept_all_certificates: false,
            timeout_secs: 30,
            hello_name: "localhost".to_string(),
        }
    }
}

impl ServerOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_security(mut self, security_mode: SecurityMode) -> Self {
        self.security_mode = security_mode;
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Trust any server certificate. Never use against production servers.
    pub fn dangerous_accept_all_certificates(mut self) -> Self {
        self.accept_all_certificates = true;
        self
    }

    pub fn certificate_policy(&self) -> CertificatePolicy {
        if self.accept_all_certificates {
            CertificatePolicy::DangerousAcceptAll
        } else {
            CertificatePolicy::Validate
        }
    }

    pub fn validate(&self) -> SendEmailResult<()> {
        if self.host.trim().is_empty() {
            return Err(SendEmailError::InvalidArgument(
                "SMTP server cannot be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(SendEmailError::InvalidArgument(
                "SMTP port cannot be zero".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(SendEmailError::InvalidArgument(
                "SMTP timeout must be at least one second".to_string(),
            ));
        }

        Ok(())
    }

    /// Everything the transport needs to open the session
    pub fn connect_params(&self) -> SendEmailResult<ConnectParams> {
        self.validate()?;

        Ok(ConnectParams {
            host: self.host.trim().to_string(),
            port: self.port,
            security: self.security_mode,
            certificates: self.certificate_policy(),
            timeout: Duration::from_secs(self.timeout_secs),
            hello_name: if self.hello_name.trim().is_empty() {
                "localhost".to_string()
            } else {
                self.hello_name.trim().to_string()
            },
        })
    }
}

/// Connection parameters derived from [`ServerOptions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    /// As configured; `Auto` is resolved by the transport
    pub security: SecurityMode,
    pub certificates: CertificatePolicy,
    pub timeout: Duration,
    pub hello_name: String,
}

/// Problems a server certificate can have during the TLS handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateIssue {
    MissingCertificate,
    NameMismatch,
    ChainErrors,
}

/// Verification switches handed to lettre's TLS builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsVerification {
    pub accept_invalid_certs: bool,
    pub accept_invalid_hostnames: bool,
}

/// Certificate validation hook installed on every TLS handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertificatePolicy {
    /// Reject a certificate with any issue
    #[default]
    Validate,
    /// Trust every certificate, including missing ones
    DangerousAcceptAll,
}

impl CertificatePolicy {
    /// Whether a certificate with `issues` is trusted. An empty slice is a
    /// certificate that validated cleanly.
    pub fn accepts(&self, issues: &[CertificateIssue]) -> bool {
        match self {
            CertificatePolicy::Validate => issues.is_empty(),
            CertificatePolicy::DangerousAcceptAll => true,
        }
    }

    pub fn verification(&self) -> TlsVerification {
        TlsVerification {
            accept_invalid_certs: self.accepts(&[
                CertificateIssue::MissingCertificate,
                CertificateIssue::ChainErrors,
            ]),
            accept_invalid_hostnames: self.accepts(&[CertificateIssue::NameMismatch]),
        }
    }

    /// TLS parameters for `domain` carrying this policy
    pub fn tls_parameters(&self, domain: &str) -> SendEmailResult<TlsParameters> {
        let verification = self.verification();

        TlsParameters::builder(domain.to_string())
            .dangerous_accept_invalid_certs(verification.accept_invalid_certs)
            .dangerous_accept_invalid_hostnames(verification.accept_invalid_hostnames)
            .build()
            .map_err(|e| SendEmailError::TransportFailure(format!("TLS configuration failed: {}", e)))
    }
}

/// The SMTP client capability driven by the sender. Implementations own one
/// session at a time.
#[async_trait]
pub trait SmtpTransport: Send {
    /// Open the session, performing TLS as `params.security` requires
    async fn connect(&mut self, params: &ConnectParams) -> SendEmailResult<()>;

    async fn authenticate(&mut self, mechanism: &AuthMechanism) -> SendEmailResult<()>;

    async fn send(&mut self, message: &Message) -> SendEmailResult<()>;

    /// Close the session. `graceful` sends QUIT first; otherwise the
    /// connection is dropped without further I/O. No-op when not connected.
    async fn disconnect(&mut self, graceful: bool) -> SendEmailResult<()>;
}

/// [`SmtpTransport`] backed by lettre's async SMTP connection
#[derive(Default)]
pub struct LettreTransport {
    connection: Option<AsyncSmtpConnection>,
}

impl LettreTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn connection(&mut self) -> SendEmailResult<&mut AsyncSmtpConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| SendEmailError::TransportFailure("Not connected".to_string()))
    }
}

#[async_trait]
impl SmtpTransport for LettreTransport {
    async fn connect(&mut self, params: &ConnectParams) -> SendEmailResult<()> {
        let security = params.security.resolve(params.port);
        let hello_name = ClientId::Domain(params.hello_name.clone());

        if params.certificates == CertificatePolicy::DangerousAcceptAll {
            tracing::warn!(
                "TLS certificate validation disabled for {}:{} - insecure!",
                params.host,
                params.port
            );
        }

        let tls_parameters = match security {
            SecurityMode::None => None,
            _ => Some(params.certificates.tls_parameters(&params.host)?),
        };

        let implicit_tls = match security {
            SecurityMode::ImplicitTls => tls_parameters.clone(),
            _ => None,
        };

        tracing::debug!("Connecting to {}:{} ({:?})", params.host, params.port, security);

        let connection = AsyncSmtpConnection::connect_tokio1(
            (params.host.as_str(), params.port),
            Some(params.timeout),
            &hello_name,
            implicit_tls,
            None,
        )
        .await
        .map_err(|e| {
            SendEmailError::TransportFailure(format!(
                "Failed to connect to {}:{}: {}",
                params.host, params.port, e
            ))
        })?;

        self.connection = Some(connection);

        let upgrade = match security {
            SecurityMode::StartTls => {
                if !self.connection()?.can_starttls() {
                    return Err(SendEmailError::TransportFailure(format!(
                        "{} does not support STARTTLS",
                        params.host
                    )));
                }
                true
            }
            SecurityMode::StartTlsIfAvailable => self.connection()?.can_starttls(),
            _ => false,
        };

        if let (true, Some(tls_parameters)) = (upgrade, tls_parameters) {
            self.connection()?
                .starttls(tls_parameters, &hello_name)
                .await
                .map_err(|e| SendEmailError::TransportFailure(format!("STARTTLS failed: {}", e)))?;
            tracing::debug!("Upgraded connection to {} with STARTTLS", params.host);
        }

        Ok(())
    }

    async fn authenticate(&mut self, mechanism: &AuthMechanism) -> SendEmailResult<()> {
        let (mechanisms, credentials) = match mechanism {
            AuthMechanism::Login { username, password } => (
                [Mechanism::Login],
                Credentials::new(username.clone(), password.clone()),
            ),
            AuthMechanism::OAuth2 { username, token } => (
                [Mechanism::Xoauth2],
                Credentials::new(username.clone(), token.clone()),
            ),
            AuthMechanism::Integrated => {
                return Err(SendEmailError::AuthenticationFailed(
                    "Integrated Windows authentication is not supported by the lettre transport"
                        .to_string(),
                ));
            }
        };

        self.connection()?
            .auth(&mechanisms, &credentials)
            .await
            .map_err(|e| SendEmailError::AuthenticationFailed(e.to_string()))?;

        Ok(())
    }

    async fn send(&mut self, message: &Message) -> SendEmailResult<()> {
        let formatted = message.formatted();

        self.connection()?
            .send(message.envelope(), &formatted)
            .await
            .map_err(|e| SendEmailError::TransportFailure(format!("Failed to send email: {}", e)))?;

        Ok(())
    }

    async fn disconnect(&mut self, graceful: bool) -> SendEmailResult<()> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };

        if graceful {
            connection
                .quit()
                .await
                .map_err(|e| SendEmailError::TransportFailure(format!("QUIT failed: {}", e)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ISSUES: [CertificateIssue; 3] = [
        CertificateIssue::MissingCertificate,
        CertificateIssue::NameMismatch,
        CertificateIssue::ChainErrors,
    ];

    #[test]
    fn test_accept_all_trusts_every_certificate() {
        let policy = ServerOptions::new("smtp.example.com", 25)
            .dangerous_accept_all_certificates()
            .certificate_policy();

        assert_eq!(policy, CertificatePolicy::DangerousAcceptAll);
        assert!(policy.accepts(&[]));
        for issue in ALL_ISSUES {
            assert!(policy.accepts(&[issue]), "{:?}", issue);
        }
        assert!(policy.accepts(&ALL_ISSUES));
    }

    #[test]
    fn test_default_policy_rejects_certificate_issues() {
        let policy = ServerOptions::new("smtp.example.com", 25).certificate_policy();

        assert_eq!(policy, CertificatePolicy::Validate);
        assert!(policy.accepts(&[]));
        for issue in ALL_ISSUES {
            assert!(!policy.accepts(&[issue]), "{:?}", issue);
        }
    }

    #[test]
    fn test_server_options_builder() {
        let options = ServerOptions::new("smtp.example.com", 465)
            .with_security(SecurityMode::ImplicitTls)
            .with_credential(Credential::UsernamePassword {
                username: "user".to_string(),
                password: "pass".to_string(),
            })
            .with_timeout(Duration::from_secs(60));

        let params = options.connect_params().unwrap();
        assert_eq!(params.host, "smtp.example.com");
        assert_eq!(params.port, 465);
        assert_eq!(params.security, SecurityMode::ImplicitTls);
        assert_eq!(params.certificates, CertificatePolicy::Validate);
        assert_eq!(params.timeout, Duration::from_secs(60));
        assert_eq!(params.hello_name, "localhost");
    }

    #[test]
    fn test_server_options_validation() {
        assert!(ServerOptions::new("", 25).validate().is_err());
        assert!(ServerOptions::new("smtp.example.com", 0).validate().is_err());
        assert!(ServerOptions::new("smtp.example.com", 25).validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let options = ServerOptions::new("smtp.example.com", 25).with_timeout(Duration::ZERO);
        assert!(matches!(
            options.connect_params(),
            Err(SendEmailError::InvalidArgument(_))
        ));

        let options = ServerOptions::new("smtp.example.com", 25).with_timeout(Duration::from_millis(500));
        assert!(options.validate().is_err());

        let options = ServerOptions::new("smtp.example.com", 25).with_timeout(Duration::from_secs(1));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_policy_maps_onto_lettre_tls_parameters() {
        let strict = CertificatePolicy::Validate;
        assert_eq!(
            strict.verification(),
            TlsVerification {
                accept_invalid_certs: false,
                accept_invalid_hostnames: false,
            }
        );

        let accept_all = CertificatePolicy::DangerousAcceptAll;
        assert_eq!(
            accept_all.verification(),
            TlsVerification {
                accept_invalid_certs: true,
                accept_invalid_hostnames: true,
            }
        );

        for policy in [strict, accept_all] {
            let params = policy.tls_parameters("smtp.example.com").unwrap();
            assert_eq!(params.domain(), "smtp.example.com");
        }
    }

    #[test]
    fn test_defaults_are_secure() {
        let options = ServerOptions::default();
        assert!(!options.accept_all_certificates);
        assert_eq!(options.security_mode, SecurityMode::Auto);
        assert_eq!(options.port, 25);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let mut transport = LettreTransport::new();
        assert!(!transport.is_connected());
        assert!(transport.disconnect(true).await.is_ok());
        assert!(transport.disconnect(false).await.is_ok());
    }

    #[tokio::test]
    async fn test_authenticate_without_session_fails() {
        let mut transport = LettreTransport::new();
        let err = transport
            .authenticate(&AuthMechanism::Login {
                username: "user".to_string(),
                password: "pass".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SendEmailError::TransportFailure(_)));
    }

    #[tokio::test]
    async fn test_integrated_auth_rejected_by_lettre_transport() {
        let mut transport = LettreTransport::new();
        let err = transport.authenticate(&AuthMechanism::Integrated).await.unwrap_err();
        assert!(matches!(err, SendEmailError::AuthenticationFailed(_)));
    }
}
