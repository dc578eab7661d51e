//! The outbound leg: one SMTP client connection per relay session.

mod client;

pub use client::TcpDialer;

use async_trait::async_trait;

use crate::error::UpstreamError;

/// Username and password forwarded with `AUTH PLAIN` (the authorization
/// identity is always empty).
#[derive(Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Opens connections to the upstream server.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Upstream;

    async fn dial(&self, hostport: &str) -> Result<Self::Connection, UpstreamError>;
}

/// A single upstream SMTP conversation.
///
/// `data`, `write_data` and `close_data` together form the message stream:
/// `data` opens it, `write_data` takes raw message bytes (the client handles
/// transparency), `close_data` terminates the message and waits for the
/// verdict.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn start_tls(&mut self, server_name: &str) -> Result<(), UpstreamError>;
    async fn authenticate(&mut self, credentials: &PlainCredentials) -> Result<(), UpstreamError>;
    async fn mail(&mut self, from: &str) -> Result<(), UpstreamError>;
    async fn rcpt(&mut self, to: &str) -> Result<(), UpstreamError>;
    async fn data(&mut self) -> Result<(), UpstreamError>;
    async fn write_data(&mut self, chunk: &[u8]) -> Result<(), UpstreamError>;
    async fn close_data(&mut self) -> Result<(), UpstreamError>;
    async fn reset(&mut self) -> Result<(), UpstreamError>;
    async fn quit(&mut self) -> Result<(), UpstreamError>;
}
