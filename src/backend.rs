use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use mailparse::MailAddr;
use serde_json::json;

use crate::error::RelayError;
use crate::logging::RelayLog;
use crate::session::Session;
use crate::upstream::{Dialer, PlainCredentials, Upstream};

/// What the protocol engine knows about the client connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub hostname: Option<String>,
    pub tls: bool,
}

/// Mailbox that receives a blind archive copy of every relayed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveAddress {
    pub email: String,
    pub name: String,
}

impl ArchiveAddress {
    /// Parses an RFC 5322 mailbox such as `Archive <arch@example.com>`.
    /// An empty string yields the empty address.
    pub fn parse(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }

        let list = mailparse::addrparse(input).with_context(|| format!("invalid archive address {input:?}"))?;
        let info = match &list[..] {
            [MailAddr::Single(info)] => info,
            _ => return Err(anyhow!("archive address {input:?} must be a single mailbox")),
        };
        match info.addr.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
            _ => return Err(anyhow!("archive address {input:?} has no domain part")),
        }

        Ok(Self {
            email: info.addr.clone(),
            name: info.display_name.clone().unwrap_or_default(),
        })
    }

    /// The `X-MSYS-API` header asking the upstream to archive a copy.
    pub fn header_line(&self) -> String {
        let directive = json!({ "archive": [{ "email": self.email, "name": self.name }] });
        format!("X-MSYS-API: {directive}\r\n")
    }
}

impl std::fmt::Display for ArchiveAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "<{}>", self.email)
        } else {
            write!(f, "{:?} <{}>", self.name, self.email)
        }
    }
}

/// Splits the TLS server name off a `host:port` pair.
pub fn upstream_host(hostport: &str) -> Option<&str> {
    let (host, port) = hostport.rsplit_once(':')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    (!host.is_empty()).then_some(host)
}

/// Process-wide relay configuration plus the entry points that create
/// sessions. Immutable once built and shared by every connection.
pub struct Backend<D: Dialer> {
    upstream_addr: String,
    upstream_host: String,
    archive: ArchiveAddress,
    log: Arc<dyn RelayLog>,
    dialer: D,
}

impl<D: Dialer> Backend<D> {
    pub fn new(dialer: D, upstream_addr: &str, archive: ArchiveAddress, log: Arc<dyn RelayLog>) -> Result<Self> {
        let upstream_host = upstream_host(upstream_addr)
            .ok_or_else(|| anyhow!("outbound address {upstream_addr:?} is not host:port"))?
            .to_string();

        Ok(Self {
            upstream_addr: upstream_addr.to_string(),
            upstream_host,
            archive,
            log,
            dialer,
        })
    }

    pub fn upstream_addr(&self) -> &str {
        &self.upstream_addr
    }

    pub fn archive(&self) -> &ArchiveAddress {
        &self.archive
    }

    pub(crate) fn log(&self) -> &dyn RelayLog {
        self.log.as_ref()
    }

    /// Opens an authenticated upstream connection with the client's
    /// credentials and wraps it in a new session.
    ///
    /// Dial and STARTTLS failures come back untranslated; an AUTH rejection
    /// comes back as the upstream's own SMTP error.
    pub async fn login(
        self: &Arc<Self>,
        info: &ConnectionInfo,
        username: &str,
        password: &str,
    ) -> Result<Session<D>, RelayError> {
        let log = self.log();
        log.step("LOGIN", format_args!("from {:?} {}", info.hostname, info.peer));

        let mut upstream = match self.dialer.dial(&self.upstream_addr).await {
            Ok(upstream) => upstream,
            Err(e) => {
                log.step("LOGIN error", format_args!("{} {}", self.upstream_addr, e));
                return Err(RelayError::Transport(e));
            }
        };
        log.step("LOGIN connected", format_args!("{}", self.upstream_addr));

        if let Err(e) = upstream.start_tls(&self.upstream_host).await {
            log.step("STARTTLS error", format_args!("{}", e));
            return Err(RelayError::Transport(e));
        }
        log.step("STARTTLS success", format_args!("{}", self.upstream_host));

        let credentials = PlainCredentials {
            username: username.to_string(),
            password: password.to_string(),
        };
        if let Err(e) = upstream.authenticate(&credentials).await {
            log.step("AUTH error", format_args!("{}", e));
            return Err(RelayError::rejected(e));
        }
        log.step("AUTH success", format_args!("{}", username));

        Ok(Session::new(upstream, Arc::clone(self)))
    }

    /// Unauthenticated clients are never relayed.
    pub fn anonymous_login(&self, info: &ConnectionInfo) -> Result<Session<D>, RelayError> {
        self.log()
            .step("anonymous LOGIN", format_args!("attempted from {:?} {}", info.hostname, info.peer));
        Err(RelayError::AuthRequired)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{EnhancedCode, SmtpError, UpstreamError};
    use crate::logging::NullLog;
    use crate::upstream::mock::MockDialer;
    use pretty_assertions::assert_eq;
    use std::fmt;
    use std::io;
    use std::sync::Mutex;

    pub fn connection() -> ConnectionInfo {
        ConnectionInfo {
            peer: "192.0.2.7:51000".parse().unwrap(),
            hostname: Some("client.example".into()),
            tls: true,
        }
    }

    pub fn backend(dialer: MockDialer, archive: ArchiveAddress) -> Arc<Backend<MockDialer>> {
        Arc::new(Backend::new(dialer, "smtp.example.com:587", archive, Arc::new(NullLog)).unwrap())
    }

    #[derive(Default)]
    struct RecordingLog(Mutex<Vec<String>>);

    impl RelayLog for RecordingLog {
        fn step(&self, step: &str, _detail: fmt::Arguments<'_>) {
            self.0.lock().unwrap().push(step.to_string());
        }
    }

    #[test]
    fn upstream_host_handles_names_and_ipv6() {
        assert_eq!(upstream_host("smtp.sparkpostmail.com:587"), Some("smtp.sparkpostmail.com"));
        assert_eq!(upstream_host("[2001:db8::1]:25"), Some("2001:db8::1"));
        assert_eq!(upstream_host("smtp.example.com"), None);
        assert_eq!(upstream_host(":25"), None);
    }

    #[test]
    fn archive_address_parsing() {
        assert_eq!(ArchiveAddress::parse("").unwrap(), ArchiveAddress::default());
        assert_eq!(
            ArchiveAddress::parse("arch@sp.com").unwrap(),
            ArchiveAddress {
                email: "arch@sp.com".into(),
                name: String::new(),
            }
        );
        assert_eq!(
            ArchiveAddress::parse("Mail Archive <arch@sp.com>").unwrap(),
            ArchiveAddress {
                email: "arch@sp.com".into(),
                name: "Mail Archive".into(),
            }
        );
        assert!(ArchiveAddress::parse("not an address").is_err());
        assert!(ArchiveAddress::parse("a@x.com, b@y.com").is_err());
    }

    #[test]
    fn archive_header_is_escaped_json() {
        let archive = ArchiveAddress {
            email: "arch@sp.com".into(),
            name: "The \"Vault\"".into(),
        };
        assert_eq!(
            archive.header_line(),
            "X-MSYS-API: {\"archive\":[{\"email\":\"arch@sp.com\",\"name\":\"The \\\"Vault\\\"\"}]}\r\n"
        );
    }

    #[test]
    fn backend_needs_host_and_port() {
        let err = Backend::new(MockDialer::default(), "smtp.example.com", ArchiveAddress::default(), Arc::new(NullLog));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn login_dials_upgrades_and_authenticates() {
        let dialer = MockDialer::default();
        let session = backend(dialer.clone(), ArchiveAddress::default())
            .login(&connection(), "alice", "secret")
            .await
            .unwrap();

        assert!(session.is_active());
        assert_eq!(
            dialer.journal(),
            vec![
                "DIAL smtp.example.com:587",
                "STARTTLS smtp.example.com",
                "AUTH PLAIN alice secret",
            ]
        );
    }

    #[tokio::test]
    async fn dial_failure_is_passed_through_raw() {
        let dialer = MockDialer::failing("dial", || {
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into()
        });
        let err = backend(dialer.clone(), ArchiveAddress::default())
            .login(&connection(), "alice", "secret")
            .await
            .err()
            .unwrap();

        assert!(matches!(err, RelayError::Transport(UpstreamError::Opaque(_))));
        assert_eq!(dialer.journal(), vec!["DIAL smtp.example.com:587"]);
    }

    #[tokio::test]
    async fn starttls_failure_is_passed_through_raw() {
        let dialer = MockDialer::failing("starttls", || UpstreamError::Legacy {
            code: 454,
            message: "4.7.0 TLS not available".into(),
        });
        let err = backend(dialer.clone(), ArchiveAddress::default())
            .login(&connection(), "alice", "secret")
            .await
            .err()
            .unwrap();

        assert!(matches!(err, RelayError::Transport(UpstreamError::Legacy { code: 454, .. })));
        assert!(!dialer.journal().iter().any(|e| e.starts_with("AUTH")));
    }

    #[tokio::test]
    async fn auth_rejection_is_translated() {
        let dialer = MockDialer::failing("auth", || UpstreamError::Legacy {
            code: 535,
            message: "5.7.8 Authentication failed".into(),
        });
        let err = backend(dialer, ArchiveAddress::default())
            .login(&connection(), "alice", "secret")
            .await
            .err()
            .unwrap();

        match err {
            RelayError::Rejected(err) => assert_eq!(
                err,
                SmtpError::new(535, Some(EnhancedCode(5, 7, 8)), "Authentication failed")
            ),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn anonymous_login_always_requires_auth() {
        let backend = backend(MockDialer::default(), ArchiveAddress::default());
        let mut info = connection();
        for tls in [true, false] {
            info.tls = tls;
            info.hostname = None;
            assert!(matches!(backend.anonymous_login(&info), Err(RelayError::AuthRequired)));
        }
    }

    #[tokio::test]
    async fn verbose_log_records_each_transition() {
        let log = Arc::new(RecordingLog::default());
        let backend = Arc::new(
            Backend::new(MockDialer::default(), "smtp.example.com:587", ArchiveAddress::default(), log.clone())
                .unwrap(),
        );
        backend.login(&connection(), "alice", "secret").await.unwrap();

        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["LOGIN", "LOGIN connected", "STARTTLS success", "AUTH success"]
        );
    }
}
