use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use super::{Dialer, PlainCredentials, Upstream};
use crate::error::{split_enhanced_code, EnhancedCode, SmtpError, UpstreamError};

/// Upper bound for a single reply line from upstream.
const MAX_REPLY_LINE: u64 = 4096;

/// Opens [`SmtpClient`] connections over TCP.
#[derive(Clone)]
pub struct TcpDialer {
    connector: TlsConnector,
    local_name: String,
}

impl TcpDialer {
    pub fn new(connector: TlsConnector, local_name: impl Into<String>) -> Self {
        Self {
            connector,
            local_name: local_name.into(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Connection = SmtpClient;

    async fn dial(&self, hostport: &str) -> Result<SmtpClient, UpstreamError> {
        let stream = TcpStream::connect(hostport).await?;
        SmtpClient::handshake(stream, self.connector.clone(), self.local_name.clone()).await
    }
}

enum Transport {
    Plain(BufStream<TcpStream>),
    Tls(Box<BufStream<TlsStream<TcpStream>>>),
}

impl Transport {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await,
            Self::Tls(stream) => stream.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await,
            Self::Tls(stream) => stream.flush().await,
        }
    }

    async fn read_line(&mut self, line: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => (&mut *stream).take(MAX_REPLY_LINE).read_until(b'\n', line).await,
            Self::Tls(stream) => (&mut **stream).take(MAX_REPLY_LINE).read_until(b'\n', line).await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        }
    }
}

/// A complete, possibly multi-line, reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    fn message(&self) -> String {
        self.lines.join("\n")
    }
}

/// Where the byte stream of an open DATA section currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DotState {
    LineStart,
    Text,
    Cr,
}

/// Applies SMTP transparency to `input`: leading dots are doubled and bare
/// LFs become CRLF.
fn dot_stuff(state: &mut DotState, input: &[u8], out: &mut Vec<u8>) {
    for &b in input {
        match (b, *state) {
            (b'\n', DotState::Cr) => {
                out.push(b'\n');
                *state = DotState::LineStart;
            }
            (b'\n', _) => {
                out.extend_from_slice(b"\r\n");
                *state = DotState::LineStart;
            }
            (b'.', DotState::LineStart) => {
                out.extend_from_slice(b"..");
                *state = DotState::Text;
            }
            (b'\r', _) => {
                out.push(b'\r');
                *state = DotState::Cr;
            }
            _ => {
                out.push(b);
                *state = DotState::Text;
            }
        }
    }
}

/// SMTP client for the upstream leg.
pub struct SmtpClient {
    transport: Option<Transport>,
    connector: TlsConnector,
    local_name: String,
    extensions: HashMap<String, String>,
    data: Option<DotState>,
}

impl SmtpClient {
    /// Reads the greeting and introduces ourselves on a fresh connection.
    pub async fn handshake(
        stream: TcpStream,
        connector: TlsConnector,
        local_name: String,
    ) -> Result<Self, UpstreamError> {
        let mut client = Self {
            transport: Some(Transport::Plain(BufStream::new(stream))),
            connector,
            local_name,
            extensions: HashMap::new(),
            data: None,
        };

        let greeting = client.read_reply().await?;
        client.expect(greeting, &[220])?;
        client.hello().await?;
        Ok(client)
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.extensions.contains_key(extension)
    }

    fn auth_mechanisms(&self) -> impl Iterator<Item = &str> {
        self.extensions
            .get("AUTH")
            .map(String::as_str)
            .unwrap_or_default()
            .split_whitespace()
    }

    async fn hello(&mut self) -> Result<(), UpstreamError> {
        let ehlo = format!("EHLO {}", self.local_name);
        let reply = self.command(&ehlo).await?;
        if reply.code == 250 {
            self.extensions = reply
                .lines
                .iter()
                .skip(1)
                .map(|line| match line.split_once(' ') {
                    Some((keyword, params)) => (keyword.to_ascii_uppercase(), params.to_string()),
                    None => (line.to_ascii_uppercase(), String::new()),
                })
                .collect();
            return Ok(());
        }

        self.extensions.clear();
        let helo = format!("HELO {}", self.local_name);
        let reply = self.command(&helo).await?;
        self.expect(reply, &[250])
    }

    fn transport(&mut self) -> io::Result<&mut Transport> {
        self.transport
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "upstream connection closed"))
    }

    async fn read_reply(&mut self) -> Result<Reply, UpstreamError> {
        let transport = self.transport()?;
        let mut code = None;
        let mut lines = Vec::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            if transport.read_line(&mut buf).await? == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed the connection").into());
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\r', '\n']);

            let malformed = || io::Error::new(io::ErrorKind::InvalidData, format!("malformed reply: {line:?}"));
            let this_code: u16 = line
                .get(..3)
                .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|c| c.parse().ok())
                .ok_or_else(malformed)?;
            if *code.get_or_insert(this_code) != this_code {
                return Err(malformed().into());
            }

            let last = match line.as_bytes().get(3) {
                None | Some(b' ') => true,
                Some(b'-') => false,
                Some(_) => return Err(malformed().into()),
            };
            lines.push(line.get(4..).unwrap_or_default().to_string());

            if last {
                return Ok(Reply { code: this_code, lines });
            }
        }
    }

    async fn command(&mut self, command: &str) -> Result<Reply, UpstreamError> {
        if self.data.is_some() {
            return Err(io::Error::new(io::ErrorKind::Other, "DATA section still open").into());
        }
        let transport = self.transport()?;
        transport.send(command.as_bytes()).await?;
        transport.send(b"\r\n").await?;
        transport.flush().await?;
        self.read_reply().await
    }

    /// Turns an unexpected reply into an error of the right shape.
    fn expect(&self, reply: Reply, codes: &[u16]) -> Result<(), UpstreamError> {
        if codes.contains(&reply.code) {
            return Ok(());
        }

        let message = reply.message();
        if self.supports("ENHANCEDSTATUSCODES") {
            let (enhanced_code, text) = split_enhanced_code(&message);
            return Err(UpstreamError::Structured(SmtpError::new(reply.code, enhanced_code, text)));
        }
        Err(UpstreamError::Legacy {
            code: reply.code,
            message,
        })
    }

    async fn simple(&mut self, command: &str, codes: &[u16]) -> Result<(), UpstreamError> {
        let reply = self.command(command).await?;
        self.expect(reply, codes)
    }
}

#[async_trait]
impl Upstream for SmtpClient {
    async fn start_tls(&mut self, server_name: &str) -> Result<(), UpstreamError> {
        let name = ServerName::try_from(server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.simple("STARTTLS", &[220]).await?;

        let stream = match self.transport.take() {
            Some(Transport::Plain(stream)) => stream.into_inner(),
            Some(tls @ Transport::Tls(_)) => {
                self.transport = Some(tls);
                return Err(io::Error::new(io::ErrorKind::Other, "connection is already TLS").into());
            }
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "upstream connection closed").into()),
        };
        let stream = self.connector.connect(name, stream).await?;
        self.transport = Some(Transport::Tls(Box::new(BufStream::new(stream))));

        self.hello().await
    }

    async fn authenticate(&mut self, credentials: &PlainCredentials) -> Result<(), UpstreamError> {
        if !self.auth_mechanisms().any(|m| m.eq_ignore_ascii_case("PLAIN")) {
            return Err(UpstreamError::Structured(SmtpError::new(
                504,
                Some(EnhancedCode(5, 5, 4)),
                "upstream does not offer AUTH PLAIN",
            )));
        }

        let response = STANDARD.encode(format!("\0{}\0{}", credentials.username, credentials.password));
        self.simple(&format!("AUTH PLAIN {response}"), &[235]).await
    }

    async fn mail(&mut self, from: &str) -> Result<(), UpstreamError> {
        let command = if self.supports("8BITMIME") {
            format!("MAIL FROM:<{from}> BODY=8BITMIME")
        } else {
            format!("MAIL FROM:<{from}>")
        };
        self.simple(&command, &[250]).await
    }

    async fn rcpt(&mut self, to: &str) -> Result<(), UpstreamError> {
        self.simple(&format!("RCPT TO:<{to}>"), &[250, 251]).await
    }

    async fn data(&mut self) -> Result<(), UpstreamError> {
        self.simple("DATA", &[354]).await?;
        self.data = Some(DotState::LineStart);
        Ok(())
    }

    async fn write_data(&mut self, chunk: &[u8]) -> Result<(), UpstreamError> {
        let Some(state) = self.data.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "no DATA section is open").into());
        };
        let mut out = Vec::with_capacity(chunk.len() + chunk.len() / 16);
        dot_stuff(state, chunk, &mut out);
        self.transport()?.send(&out).await?;
        Ok(())
    }

    async fn close_data(&mut self) -> Result<(), UpstreamError> {
        let Some(state) = self.data.take() else {
            return Err(io::Error::new(io::ErrorKind::Other, "no DATA section is open").into());
        };
        let transport = self.transport()?;
        if state != DotState::LineStart {
            transport.send(b"\r\n").await?;
        }
        transport.send(b".\r\n").await?;
        transport.flush().await?;

        let reply = self.read_reply().await?;
        self.expect(reply, &[250])
    }

    async fn reset(&mut self) -> Result<(), UpstreamError> {
        self.simple("RSET", &[250]).await
    }

    async fn quit(&mut self) -> Result<(), UpstreamError> {
        let result = self.simple("QUIT", &[221]).await;
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.shutdown().await;
        }
        result
    }
}
