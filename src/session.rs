use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::backend::Backend;
use crate::error::{RelayError, UpstreamError};
use crate::upstream::{Dialer, Upstream};

const COPY_BUFFER: usize = 8 * 1024;

/// One authenticated client, relayed onto its own upstream connection.
///
/// A session is active from the moment [`Backend::login`] creates it until
/// [`Session::logout`], after which it is closed for good.
pub struct Session<D: Dialer> {
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    upstream: Option<D::Connection>,
    backend: Arc<Backend<D>>,
}

impl<D: Dialer> Session<D> {
    pub(crate) fn new(upstream: D::Connection, backend: Arc<Backend<D>>) -> Self {
        Self {
            mail_from: None,
            rcpt_to: Vec::new(),
            upstream: Some(upstream),
            backend,
        }
    }

    pub fn mail_from(&self) -> Option<&str> {
        self.mail_from.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.rcpt_to
    }

    pub fn is_active(&self) -> bool {
        self.upstream.is_some()
    }

    /// Drops the upstream connection without a QUIT.
    fn abandon(&mut self) {
        self.upstream = None;
        self.mail_from = None;
        self.rcpt_to.clear();
    }

    fn upstream(&mut self) -> Result<&mut D::Connection, RelayError> {
        self.upstream.as_mut().ok_or(RelayError::Closed)
    }

    pub async fn mail(&mut self, from: &str) -> Result<(), RelayError> {
        self.backend.log().step("MAIL FROM", format_args!("{}", from));
        if let Err(e) = self.upstream()?.mail(from).await {
            self.backend.log().step("MAIL FROM error", format_args!("{}", e));
            return Err(RelayError::rejected(e));
        }
        self.mail_from = Some(from.to_string());
        self.backend.log().step("MAIL FROM accepted", format_args!("{}", from));
        Ok(())
    }

    pub async fn rcpt(&mut self, to: &str) -> Result<(), RelayError> {
        self.backend.log().step("RCPT TO", format_args!("{}", to));
        if let Err(e) = self.upstream()?.rcpt(to).await {
            self.backend.log().step("RCPT TO error", format_args!("{}", e));
            return Err(RelayError::rejected(e));
        }
        self.rcpt_to.push(to.to_string());
        self.backend.log().step("RCPT TO accepted", format_args!("{}", to));
        Ok(())
    }

    /// Streams `body` upstream behind the archive header.
    ///
    /// Opening the data stream and copying report raw errors; only the final
    /// verdict on close is translated.
    pub async fn data<R>(&mut self, mut body: R) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let backend = Arc::clone(&self.backend);
        let log = backend.log();
        log.step("DATA", format_args!("{} recipient(s)", self.rcpt_to.len()));

        let upstream = self.upstream()?;
        if let Err(e) = upstream.data().await {
            log.step("DATA error", format_args!("{}", e));
            return Err(RelayError::Transport(e));
        }

        // A failed copy leaves the upstream inside DATA with no way to end the
        // message cleanly, so the connection is dropped and the session closes.
        let header = backend.archive().header_line();
        if let Err(e) = upstream.write_data(header.as_bytes()).await {
            log.step("DATA copy error", format_args!("{}", e));
            self.abandon();
            return Err(RelayError::Transport(e));
        }

        let mut buf = vec![0u8; COPY_BUFFER];
        let mut copied = 0usize;
        loop {
            let n = match body.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log.step("DATA copy error", format_args!("{}", e));
                    self.abandon();
                    return Err(RelayError::Transport(UpstreamError::Opaque(e)));
                }
            };
            if let Err(e) = upstream.write_data(&buf[..n]).await {
                log.step("DATA copy error", format_args!("{}", e));
                self.abandon();
                return Err(RelayError::Transport(e));
            }
            copied += n;
        }

        if let Err(e) = upstream.close_data().await {
            log.step("DATA close error", format_args!("{}", e));
            return Err(RelayError::rejected(e));
        }
        log.step("DATA accepted", format_args!("{} bytes", copied));
        Ok(())
    }

    /// Forgets the current transaction, both here and upstream. Failures are
    /// only logged: the next MAIL FROM will surface a broken upstream anyway.
    pub async fn reset(&mut self) {
        let open = self.mail_from.take().is_some() || !self.rcpt_to.is_empty();
        self.rcpt_to.clear();

        if !open {
            return;
        }
        let backend = Arc::clone(&self.backend);
        if let Some(upstream) = self.upstream.as_mut() {
            backend.log().step("RSET", format_args!(""));
            if let Err(e) = upstream.reset().await {
                backend.log().step("RSET error", format_args!("{}", e));
            }
        }
    }

    /// Quits upstream and closes the session. State is cleared even when
    /// QUIT fails; a closed session logs out as a no-op.
    pub async fn logout(&mut self) -> Result<(), RelayError> {
        let Some(mut upstream) = self.upstream.take() else {
            return Ok(());
        };
        self.mail_from = None;
        self.rcpt_to.clear();

        let log = self.backend.log();
        log.step("QUIT", format_args!(""));
        match upstream.quit().await {
            Ok(()) => {
                log.step("QUIT success", format_args!(""));
                Ok(())
            }
            Err(e) => {
                log.step("QUIT error", format_args!("{}", e));
                Err(RelayError::rejected(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::{backend, connection};
    use crate::backend::ArchiveAddress;
    use crate::error::{EnhancedCode, SmtpError};
    use crate::upstream::mock::MockDialer;
    use pretty_assertions::assert_eq;
    use std::io;
    use std::pin::Pin;
    use crate::logging::NullLog;
    use crate::tls;
    use crate::upstream::TcpDialer;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time;

    async fn login(dialer: &MockDialer, archive: ArchiveAddress) -> Session<MockDialer> {
        backend(dialer.clone(), archive)
            .login(&connection(), "alice", "secret")
            .await
            .unwrap()
    }

    fn archive() -> ArchiveAddress {
        ArchiveAddress {
            email: "arch@sp.com".into(),
            name: String::new(),
        }
    }

    /// Yields `prefix` and then fails.
    struct BrokenBody(&'static [u8]);

    impl AsyncRead for BrokenBody {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            if self.0.is_empty() {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")));
            }
            buf.put_slice(self.0);
            self.0 = &[];
            Poll::Ready(Ok(()))
        }
    }

    /// Plain-text upstream on loopback that accepts everything and records
    /// each line it receives.
    async fn loopback_upstream() -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = tokio::io::split(stream);
            let mut reader = BufReader::new(reader);
            let mut seen = Vec::new();
            let mut in_data = false;

            writer.write_all(b"220 upstream ESMTP\r\n").await.unwrap();
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let line = line.trim_end_matches("\r\n").to_string();
                seen.push(line.clone());

                let reply = match (in_data, line.as_str()) {
                    (true, ".") => {
                        in_data = false;
                        "250 queued"
                    }
                    (true, _) => continue,
                    (false, "DATA") => {
                        in_data = true;
                        "354 go ahead"
                    }
                    (false, "QUIT") => "221 bye",
                    _ => "250 ok",
                };
                if writer.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            seen
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn full_relay_scenario() {
        let dialer = MockDialer::default();
        let mut session = login(&dialer, archive()).await;

        session.mail("a@x.com").await.unwrap();
        assert_eq!(session.mail_from(), Some("a@x.com"));

        session.rcpt("b@y.com").await.unwrap();
        session.rcpt("c@z.com").await.unwrap();
        assert_eq!(session.recipients(), ["b@y.com", "c@z.com"]);

        session.data(&b"Subject: hi\n\nhello"[..]).await.unwrap();
        assert_eq!(
            String::from_utf8(dialer.body()).unwrap(),
            "X-MSYS-API: {\"archive\":[{\"email\":\"arch@sp.com\",\"name\":\"\"}]}\r\nSubject: hi\n\nhello"
        );

        session.logout().await.unwrap();
        assert!(!session.is_active());
        assert_eq!(session.mail_from(), None);
        assert!(session.recipients().is_empty());
        assert_eq!(dialer.journal().last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn recipients_keep_call_order_and_duplicates() {
        let dialer = MockDialer::default();
        let mut session = login(&dialer, archive()).await;
        session.mail("a@x.com").await.unwrap();

        let addresses = ["z@x.com", "a@x.com", "m@x.com", "a@x.com"];
        for address in addresses {
            session.rcpt(address).await.unwrap();
        }
        assert_eq!(session.recipients(), addresses);
    }

    #[tokio::test]
    async fn rejected_mail_leaves_sender_unset() {
        let dialer = MockDialer::failing("mail", || UpstreamError::Legacy {
            code: 550,
            message: "5.7.1 Sender denied".into(),
        });
        let mut session = login(&dialer, archive()).await;

        let err = session.mail("a@x.com").await.unwrap_err();
        match err {
            RelayError::Rejected(err) => {
                assert_eq!(err, SmtpError::new(550, Some(EnhancedCode(5, 7, 1)), "Sender denied"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(session.mail_from(), None);
    }

    #[tokio::test]
    async fn rejected_rcpt_keeps_earlier_state() {
        let dialer = MockDialer::default();
        let mut session = login(&dialer, archive()).await;
        session.mail("a@x.com").await.unwrap();
        session.rcpt("b@y.com").await.unwrap();

        let failing = MockDialer::failing("rcpt", || UpstreamError::Legacy {
            code: 550,
            message: "No such user".into(),
        });
        let mut rejecting = login(&failing, archive()).await;
        rejecting.mail("a@x.com").await.unwrap();
        let err = rejecting.rcpt("nobody@y.com").await.unwrap_err();

        assert!(matches!(err, RelayError::Rejected(SmtpError { code: 550, enhanced_code: None, .. })));
        assert_eq!(rejecting.mail_from(), Some("a@x.com"));
        assert!(rejecting.recipients().is_empty());
        assert_eq!(session.recipients(), ["b@y.com"]);
    }

    #[tokio::test]
    async fn data_open_failure_is_raw() {
        let dialer = MockDialer::failing("data", || UpstreamError::Legacy {
            code: 554,
            message: "5.5.1 No valid recipients".into(),
        });
        let mut session = login(&dialer, archive()).await;

        let err = session.data(&b"body"[..]).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(UpstreamError::Legacy { code: 554, .. })));
        assert!(dialer.body().is_empty());
    }

    #[tokio::test]
    async fn data_copy_failure_is_raw() {
        let dialer = MockDialer::default();
        let mut session = login(&dialer, archive()).await;

        let err = session.data(BrokenBody(b"Subject: partial\n")).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(UpstreamError::Opaque(_))));
        assert!(!dialer.journal().contains(&".".to_string()));
    }

    #[tokio::test]
    async fn copy_failure_drops_the_stuck_upstream() {
        let (addr, upstream) = loopback_upstream().await;
        let dialer = TcpDialer::new(tls::upstream_connector(), "relay.test");
        let connection = dialer.dial(&addr).await.unwrap();
        let backend = Arc::new(Backend::new(dialer, &addr, archive(), Arc::new(NullLog)).unwrap());
        let mut session = Session::new(connection, backend);

        session.mail("a@x.com").await.unwrap();
        session.rcpt("b@y.com").await.unwrap();
        let err = session.data(BrokenBody(b"Subject: partial\n")).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(UpstreamError::Opaque(_))));
        assert!(!session.is_active());

        let finished = time::timeout(Duration::from_secs(5), async {
            session.reset().await;
            session.logout().await
        })
        .await;
        assert!(matches!(finished, Ok(Ok(()))));

        let seen = upstream.await.unwrap();
        assert!(seen.contains(&"DATA".to_string()));
        assert!(!seen.iter().any(|line| line == "RSET" || line == "QUIT"));
    }

    #[tokio::test]
    async fn data_close_failure_is_translated() {
        let dialer = MockDialer::failing("close", || UpstreamError::Legacy {
            code: 552,
            message: "5.3.4 Message too big".into(),
        });
        let mut session = login(&dialer, archive()).await;

        let err = session.data(&b"body"[..]).await.unwrap_err();
        match err {
            RelayError::Rejected(err) => {
                assert_eq!(err, SmtpError::new(552, Some(EnhancedCode(5, 3, 4)), "Message too big"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_clears_transaction_and_resets_upstream() {
        let dialer = MockDialer::default();
        let mut session = login(&dialer, archive()).await;
        session.mail("a@x.com").await.unwrap();
        session.rcpt("b@y.com").await.unwrap();

        session.reset().await;
        assert_eq!(session.mail_from(), None);
        assert!(session.recipients().is_empty());
        assert!(session.is_active());
        assert_eq!(dialer.journal().last().map(String::as_str), Some("RSET"));

        // Nothing open: no upstream round trip.
        let before = dialer.journal().len();
        session.reset().await;
        assert_eq!(dialer.journal().len(), before);
    }

    #[tokio::test]
    async fn second_logout_is_a_no_op() {
        let dialer = MockDialer::default();
        let mut session = login(&dialer, archive()).await;

        session.logout().await.unwrap();
        let after_first = dialer.journal();
        session.logout().await.unwrap();
        assert_eq!(dialer.journal(), after_first);
    }

    #[tokio::test]
    async fn failed_quit_still_closes() {
        let dialer = MockDialer::failing("quit", || UpstreamError::Legacy {
            code: 421,
            message: "4.4.2 Timeout".into(),
        });
        let mut session = login(&dialer, archive()).await;
        session.mail("a@x.com").await.unwrap();

        let err = session.logout().await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Rejected(SmtpError {
                code: 421,
                enhanced_code: Some(EnhancedCode(4, 4, 2)),
                ..
            })
        ));
        assert!(!session.is_active());
        assert_eq!(session.mail_from(), None);
        assert!(session.logout().await.is_ok());
    }

    #[tokio::test]
    async fn closed_session_refuses_commands() {
        let dialer = MockDialer::default();
        let mut session = login(&dialer, archive()).await;
        session.logout().await.unwrap();

        assert!(matches!(session.mail("a@x.com").await, Err(RelayError::Closed)));
        assert!(matches!(session.rcpt("b@y.com").await, Err(RelayError::Closed)));
        assert!(matches!(session.data(&b""[..]).await, Err(RelayError::Closed)));
    }
}
