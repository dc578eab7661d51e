use crate::auth::{AuthError, Credentials, Exchange, Mechanism, Step};
use crate::backend::{Backend, ConnectionInfo};
use crate::error::{split_enhanced_code, EnhancedCode, RelayError};
use crate::logging::{DebugSink, Direction};
use crate::session::Session;
use crate::upstream::Dialer;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

/// Longest command line accepted from a client.
const MAX_COMMAND_LINE: u64 = 2048;

/// DATA is read in chunks of at most this many bytes.
const MAX_DATA_CHUNK: u64 = 64 * 1024;

/// Inbound protocol settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub domain: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub allow_insecure_auth: bool,
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    enhanced: Option<EnhancedCode>,
    lines: Vec<String>,
}

impl Reply {
    fn new(code: u16, enhanced: Option<EnhancedCode>, text: impl Into<String>) -> Self {
        Self {
            code,
            enhanced,
            lines: vec![text.into()],
        }
    }

    fn ok(text: impl Into<String>) -> Self {
        Self::new(250, Some(EnhancedCode(2, 0, 0)), text)
    }

    fn bad_sequence(text: &str) -> Self {
        Self::new(502, Some(EnhancedCode(5, 5, 1)), text)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            match self.enhanced {
                Some(enh) => out.push_str(&format!("{}{}{} {}\r\n", self.code, sep, enh, line)),
                None => out.push_str(&format!("{}{}{}\r\n", self.code, sep, line)),
            }
        }
        out
    }
}

/// Maps a relay failure onto a client reply. `transient` is used when the
/// failure carries no usable SMTP code.
fn failure_reply(err: RelayError, transient: Reply) -> Reply {
    match err {
        RelayError::AuthRequired => Reply::new(502, Some(EnhancedCode(5, 7, 0)), "Please authenticate first"),
        // Unknown codes and stray positive replies never reach the client
        // as success.
        RelayError::Rejected(err) if err.code < 400 => Reply {
            lines: vec![err.message],
            ..transient
        },
        RelayError::Rejected(err) => {
            // Continuation lines repeat the enhanced code that render adds.
            let lines = err
                .message
                .split('\n')
                .map(|line| match (err.enhanced_code, split_enhanced_code(line)) {
                    (Some(code), (Some(repeated), rest)) if code == repeated => rest.to_string(),
                    _ => line.to_string(),
                })
                .collect();
            Reply {
                code: err.code,
                enhanced: err.enhanced_code,
                lines,
            }
        }
        RelayError::Transport(e) => {
            tracing::warn!(error = %e, "upstream transport failure");
            transient
        }
        RelayError::Closed => transient,
    }
}

fn auth_failure_reply(err: AuthError) -> Reply {
    match err {
        AuthError::Cancelled => Reply::new(501, Some(EnhancedCode(5, 0, 0)), "Negotiation cancelled"),
        AuthError::UnsupportedMechanism => Reply::new(504, Some(EnhancedCode(5, 5, 4)), "Unsupported authentication mechanism"),
        AuthError::IdentityNotSupported => Reply::new(535, Some(EnhancedCode(5, 7, 8)), err.to_string()),
        AuthError::InvalidEncoding | AuthError::Malformed => Reply::new(501, Some(EnhancedCode(5, 5, 2)), err.to_string()),
    }
}

/// Extracts the path from `FROM:<addr> params` / `TO:<addr>`.
fn parse_path<'a>(arg: &'a str, prefix: &str) -> Option<&'a str> {
    let head = arg.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = arg[prefix.len()..].trim_start();
    match rest.strip_prefix('<') {
        Some(inner) => inner.split_once('>').map(|(path, _)| path),
        None => rest.split_whitespace().next(),
    }
}

enum Action {
    Reply(Reply),
    Data,
    StartTls,
    Quit,
}

/// Per-connection protocol state.
struct Conversation<D: Dialer> {
    info: ConnectionInfo,
    session: Option<Session<D>>,
    auth: Option<Exchange>,
}

impl<D: Dialer> Conversation<D> {
    fn new(peer: SocketAddr) -> Self {
        Self {
            info: ConnectionInfo {
                peer,
                hostname: None,
                tls: false,
            },
            session: None,
            auth: None,
        }
    }

    /// Ends the relay session, if any. Called on QUIT, disconnect and TLS
    /// upgrade alike.
    async fn close(&mut self) {
        if let Some(mut session) = self.session.take().filter(Session::is_active) {
            if let Err(e) = session.logout().await {
                tracing::debug!(error = %e, "upstream logout failed");
            }
        }
    }
}

pub struct SmtpRelay<D: Dialer> {
    backend: Arc<Backend<D>>,
    settings: RelaySettings,
    tls_acceptor: Option<TlsAcceptor>,
    debug: Option<DebugSink>,
}

impl<D: Dialer> SmtpRelay<D> {
    pub fn new(
        backend: Arc<Backend<D>>,
        settings: RelaySettings,
        tls_acceptor: Option<TlsAcceptor>,
        debug: Option<DebugSink>,
    ) -> Self {
        Self {
            backend,
            settings,
            tls_acceptor,
            debug,
        }
    }

    async fn trace(&self, conv: &Conversation<D>, direction: Direction, text: &str) {
        if let Some(debug) = &self.debug {
            debug.record(&conv.info.peer, direction, text).await;
        }
    }

    async fn with_deadline<T, F>(&self, limit: Duration, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(anyhow!("{} timed out after {:?}", what, limit)),
        }
    }

    async fn read_chunk<S>(&self, stream: &mut BufReader<S>, buf: &mut Vec<u8>, limit: u64) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        buf.clear();
        let mut limited = (&mut *stream).take(limit);
        self.with_deadline(self.settings.read_timeout, "read", limited.read_until(b'\n', buf))
            .await
    }

    async fn send<S>(&self, stream: &mut BufReader<S>, conv: &Conversation<D>, reply: &Reply) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let text = reply.render();
        self.trace(conv, Direction::Server, &text).await;
        let write = async {
            stream.write_all(text.as_bytes()).await?;
            stream.flush().await
        };
        self.with_deadline(self.settings.write_timeout, "write", write).await
    }

    fn ehlo_reply(&self, conv: &Conversation<D>, client: &str) -> Reply {
        let mut lines = vec![
            format!("{} Hello {}", self.settings.domain, client),
            "8BITMIME".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
            format!("SIZE {}", self.settings.max_message_bytes),
        ];
        if self.tls_acceptor.is_some() && !conv.info.tls {
            lines.push("STARTTLS".to_string());
        }
        if conv.info.tls || self.settings.allow_insecure_auth {
            lines.push(format!("AUTH {}", Mechanism::ADVERTISED));
        }
        Reply {
            code: 250,
            enhanced: None,
            lines,
        }
    }

    async fn login(&self, conv: &mut Conversation<D>, credentials: Credentials) -> Reply {
        let temporary = Reply::new(454, Some(EnhancedCode(4, 7, 0)), "Temporary authentication failure");
        match self
            .backend
            .login(&conv.info, &credentials.username, &credentials.password)
            .await
        {
            Ok(session) => {
                conv.session = Some(session);
                Reply::new(235, Some(EnhancedCode(2, 7, 0)), "Authentication succeeded")
            }
            Err(e) => failure_reply(e, temporary),
        }
    }

    async fn auth_step(&self, conv: &mut Conversation<D>, step: Result<Step, AuthError>) -> Reply {
        match step {
            Ok(Step::Challenge(exchange, challenge)) => {
                conv.auth = Some(exchange);
                Reply::new(334, None, challenge)
            }
            Ok(Step::Done(credentials)) => self.login(conv, credentials).await,
            Err(e) => auth_failure_reply(e),
        }
    }

    async fn dispatch(&self, conv: &mut Conversation<D>, line: &str) -> Action {
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };
        let transient = Reply::new(451, Some(EnhancedCode(4, 0, 0)), "Upstream temporarily unavailable");

        let reply = match verb.to_ascii_uppercase().as_str() {
            "HELO" | "EHLO" => {
                if arg.is_empty() {
                    Reply::new(501, Some(EnhancedCode(5, 5, 4)), "Domain/address argument required")
                } else {
                    conv.info.hostname = Some(arg.to_string());
                    if let Some(session) = conv.session.as_mut() {
                        session.reset().await;
                    }
                    if verb.eq_ignore_ascii_case("EHLO") {
                        self.ehlo_reply(conv, arg)
                    } else {
                        Reply::new(250, None, format!("{} Hello {}", self.settings.domain, arg))
                    }
                }
            }

            "STARTTLS" => {
                if conv.info.tls {
                    Reply::bad_sequence("Already running in TLS")
                } else if self.tls_acceptor.is_none() {
                    Reply::bad_sequence("TLS not supported")
                } else {
                    return Action::StartTls;
                }
            }

            "AUTH" => {
                if conv.info.hostname.is_none() {
                    Reply::bad_sequence("Please introduce yourself first.")
                } else if conv.session.is_some() {
                    Reply::new(503, Some(EnhancedCode(5, 5, 1)), "Already authenticated")
                } else if !conv.info.tls && !self.settings.allow_insecure_auth {
                    Reply::new(523, Some(EnhancedCode(5, 7, 10)), "TLS is required")
                } else {
                    let mut parts = arg.split_whitespace();
                    let step = parts
                        .next()
                        .unwrap_or_default()
                        .parse::<Mechanism>()
                        .and_then(|mechanism| {
                            let initial = parts.next().map(|ir| if ir == "=" { "" } else { ir });
                            Exchange::start(mechanism, initial)
                        });
                    self.auth_step(conv, step).await
                }
            }

            "MAIL" => {
                if conv.info.hostname.is_none() {
                    return Action::Reply(Reply::bad_sequence("Please introduce yourself first."));
                }
                if conv.session.is_none() {
                    match self.backend.anonymous_login(&conv.info) {
                        Ok(session) => conv.session = Some(session),
                        Err(e) => return Action::Reply(failure_reply(e, transient)),
                    }
                }
                let Some(session) = conv.session.as_mut() else {
                    return Action::Reply(transient);
                };
                if session.mail_from().is_some() {
                    Reply::bad_sequence("Nested MAIL command")
                } else {
                    match parse_path(arg, "FROM:") {
                        None => Reply::new(501, Some(EnhancedCode(5, 5, 2)), "Was expecting MAIL arg syntax of FROM:<address>"),
                        Some(from) => match session.mail(from).await {
                            Ok(()) => Reply::ok(format!("Roger, accepting mail from <{}>", from)),
                            Err(e) => failure_reply(e, transient),
                        },
                    }
                }
            }

            "RCPT" => match conv.session.as_mut() {
                Some(session) if session.mail_from().is_some() => match parse_path(arg, "TO:") {
                    Some(to) if !to.is_empty() => match session.rcpt(to).await {
                        Ok(()) => Reply::ok(format!("I'll make sure <{}> gets this", to)),
                        Err(e) => failure_reply(e, transient),
                    },
                    _ => Reply::new(501, Some(EnhancedCode(5, 5, 2)), "Was expecting RCPT arg syntax of TO:<address>"),
                },
                _ => Reply::bad_sequence("Missing MAIL FROM command."),
            },

            "DATA" => match conv.session.as_ref() {
                Some(session) if !session.recipients().is_empty() => return Action::Data,
                _ => Reply::bad_sequence("Missing RCPT TO command."),
            },

            "RSET" => {
                if let Some(session) = conv.session.as_mut() {
                    session.reset().await;
                }
                Reply::ok("Session reset")
            }

            "NOOP" => Reply::ok("OK"),
            "VRFY" => Reply::new(252, Some(EnhancedCode(2, 5, 0)), "Cannot VRFY user, but will accept message"),
            "QUIT" => return Action::Quit,
            _ => Reply::new(500, Some(EnhancedCode(5, 5, 2)), "Syntax error, command unrecognized"),
        };

        Action::Reply(reply)
    }

    /// Reads the message up to the terminating dot and relays it.
    async fn receive_data<S>(&self, stream: &mut BufReader<S>, conv: &mut Conversation<D>) -> Result<Reply>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut body = Vec::new();
        let mut chunk = Vec::new();
        let mut at_line_start = true;
        let mut too_big = false;

        loop {
            if self.read_chunk(stream, &mut chunk, MAX_DATA_CHUNK).await? == 0 {
                bail!("connection closed during DATA");
            }
            if at_line_start && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }
            let content = match chunk.strip_prefix(b".") {
                Some(rest) if at_line_start => rest,
                _ => &chunk[..],
            };
            at_line_start = chunk.ends_with(b"\n");

            if body.len() + content.len() > self.settings.max_message_bytes {
                too_big = true;
            } else if !too_big {
                body.extend_from_slice(content);
            }
        }
        self.trace(conv, Direction::Client, &format!("<{} bytes of message data>", body.len()))
            .await;

        let Some(session) = conv.session.as_mut() else {
            return Ok(Reply::bad_sequence("Missing RCPT TO command."));
        };
        let reply = if too_big {
            Reply::new(552, Some(EnhancedCode(5, 3, 4)), "Maximum message size exceeded")
        } else {
            match session.data(&body[..]).await {
                Ok(()) => Reply::ok("OK: queued"),
                Err(e) => failure_reply(e, Reply::new(451, Some(EnhancedCode(4, 0, 0)), "Upstream temporarily unavailable")),
            }
        };
        session.reset().await;
        if !session.is_active() {
            conv.session = None;
        }
        Ok(reply)
    }

    /// Runs the command loop until QUIT, disconnect or STARTTLS. On STARTTLS
    /// the raw stream is handed back for the upgrade.
    async fn converse<S>(&self, stream: S, conv: &mut Conversation<D>, greet: bool) -> Result<Option<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        if greet {
            let banner = Reply::new(220, None, format!("{} ESMTP Service Ready", self.settings.domain));
            self.send(&mut stream, conv, &banner).await?;
        }

        let mut line = Vec::new();
        loop {
            let n = self.read_chunk(&mut stream, &mut line, MAX_COMMAND_LINE).await?;
            if n == 0 {
                return Ok(None);
            }
            if !line.ends_with(b"\n") && n as u64 == MAX_COMMAND_LINE {
                let reply = Reply::new(500, Some(EnhancedCode(5, 5, 2)), "Line too long");
                self.send(&mut stream, conv, &reply).await?;
                return Ok(None);
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);

            let action = match conv.auth.take() {
                Some(exchange) => {
                    self.trace(conv, Direction::Client, "<credentials>").await;
                    let step = exchange.step(text);
                    Action::Reply(self.auth_step(conv, step).await)
                }
                None => {
                    let logged = match text.split_whitespace().collect::<Vec<_>>()[..] {
                        [verb, mechanism, _] if verb.eq_ignore_ascii_case("AUTH") => format!("{} {} <credentials>", verb, mechanism),
                        _ => text.to_string(),
                    };
                    self.trace(conv, Direction::Client, &logged).await;
                    self.dispatch(conv, text).await
                }
            };

            match action {
                Action::Reply(reply) => self.send(&mut stream, conv, &reply).await?,
                Action::Data => {
                    let go_ahead = Reply::new(354, None, "Go ahead. End your data with <CR><LF>.<CR><LF>");
                    self.send(&mut stream, conv, &go_ahead).await?;
                    let reply = self.receive_data(&mut stream, conv).await?;
                    self.send(&mut stream, conv, &reply).await?;
                }
                Action::StartTls => {
                    let ready = Reply::new(220, Some(EnhancedCode(2, 0, 0)), "Ready to start TLS");
                    self.send(&mut stream, conv, &ready).await?;
                    if !stream.buffer().is_empty() {
                        bail!("client pipelined data after STARTTLS");
                    }
                    return Ok(Some(stream.into_inner()));
                }
                Action::Quit => {
                    let bye = Reply::new(221, Some(EnhancedCode(2, 0, 0)), "Bye");
                    self.send(&mut stream, conv, &bye).await?;
                    return Ok(None);
                }
            }
        }
    }

    /// Serves one client connection from greeting to disconnect.
    pub async fn handle_client<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conv = Conversation::new(peer);
        self.backend.log().step("connect", format_args!("{}", peer));

        let result = match self.converse(stream, &mut conv, true).await {
            Ok(Some(stream)) => self.upgrade(stream, &mut conv).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        conv.close().await;
        self.backend.log().step("disconnect", format_args!("{}", peer));
        result
    }

    async fn upgrade<S>(&self, stream: S, conv: &mut Conversation<D>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let acceptor = self.tls_acceptor.clone().context("STARTTLS without a certificate")?;
        let tls = self
            .with_deadline(self.settings.read_timeout, "TLS handshake", acceptor.accept(stream))
            .await?;

        conv.close().await;
        conv.info.hostname = None;
        conv.info.tls = true;
        self.trace(conv, Direction::Client, "<TLS established>").await;

        self.converse(tls, conv, false).await.map(|_| ())
    }

    /// Serves `stream` on its own task inside a span carrying the peer.
    pub fn spawn_client<S>(self: &Arc<Self>, stream: S, peer: SocketAddr) -> JoinHandle<Result<()>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let this = Arc::clone(self);
        let span = tracing::info_span!("client", %peer);
        tokio::spawn(
            async move {
                let result = this.handle_client(stream, peer).await;
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "connection ended with error");
                }
                result
            }
            .instrument(span),
        )
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        tracing::info!(%addr, "listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    self.spawn_client(stream, peer);
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept error");
                }
            }
        }
    }
}
