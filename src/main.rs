mod auth;
mod backend;
mod error;
mod logging;
mod server;
mod session;
mod tls;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;

use crate::backend::{ArchiveAddress, Backend};
use crate::logging::{DebugSink, NullLog, RelayLog, TracingLog};
use crate::server::{RelaySettings, SmtpRelay};
use crate::tls::ServerIdentity;
use crate::upstream::TcpDialer;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-auth-relay",
    about = "An SMTP relay that authenticates clients against the upstream server it forwards to",
    author = "2026, Philippe TEMESI <https://www.tems.be>",
    version = "0.1.0"
)]
pub struct Opt {
    /// Address to serve incoming SMTP requests on
    #[structopt(long = "in-hostport", default_value = "localhost:587")]
    pub in_hostport: String,

    /// host:port for onward routing of SMTP requests
    #[structopt(long = "out-hostport", default_value = "smtp.sparkpostmail.com:587")]
    pub out_hostport: String,

    /// Log every relay session step
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Certificate chain for this server
    #[structopt(long = "certfile", default_value = "fullchain.pem", parse(from_os_str))]
    pub certfile: PathBuf,

    /// Private key for this server
    #[structopt(long = "privkeyfile", default_value = "privkey.pem", parse(from_os_str))]
    pub privkeyfile: PathBuf,

    /// File to append the raw client SMTP conversation to
    #[structopt(long = "server-debug", parse(from_os_str))]
    pub server_debug: Option<PathBuf>,

    /// Address to archive a blind copy of every message to (SparkPost only)
    #[structopt(long = "archive-email", default_value = "")]
    pub archive_email: String,

    /// Inbound read timeout in seconds
    #[structopt(long = "read-timeout", default_value = "60")]
    pub read_timeout: u64,

    /// Inbound write timeout in seconds
    #[structopt(long = "write-timeout", default_value = "60")]
    pub write_timeout: u64,

    /// Largest message accepted, in bytes
    #[structopt(long = "max-message-bytes", default_value = "33554432")]
    pub max_message_bytes: usize,

    /// Refuse AUTH until the client has issued STARTTLS
    #[structopt(long = "no-insecure-auth")]
    pub no_insecure_auth: bool,
}

fn build(opt: &Opt) -> Result<SmtpRelay<TcpDialer>> {
    tracing::info!("Incoming host:port set to {}", opt.in_hostport);

    let identity = ServerIdentity::load(&opt.certfile, &opt.privkeyfile)?;
    tracing::info!("Gathered certificate {:?} and key {:?}", opt.certfile, opt.privkeyfile);
    tracing::info!("Incoming server name will advertise as {}", identity.domain);

    let archive = ArchiveAddress::parse(&opt.archive_email).context("Archive")?;
    tracing::info!("Archive email copy sent to: {}", archive);

    let log: Arc<dyn RelayLog> = if opt.verbose {
        Arc::new(TracingLog)
    } else {
        Arc::new(NullLog)
    };
    tracing::info!("Backend logging {}", opt.verbose);

    let dialer = TcpDialer::new(tls::upstream_connector(), identity.domain.clone());
    let backend = Arc::new(Backend::new(dialer, &opt.out_hostport, archive, log)?);
    tracing::info!("Outgoing host:port set to {}", backend.upstream_addr());

    let debug = match &opt.server_debug {
        Some(path) => {
            let sink = DebugSink::open(path)?;
            tracing::info!("Server logging SMTP commands and responses to {:?}", path);
            Some(sink)
        }
        None => None,
    };

    let settings = RelaySettings {
        domain: identity.domain,
        read_timeout: Duration::from_secs(opt.read_timeout),
        write_timeout: Duration::from_secs(opt.write_timeout),
        allow_insecure_auth: !opt.no_insecure_auth,
        max_message_bytes: opt.max_message_bytes,
    };

    Ok(SmtpRelay::new(backend, settings, Some(identity.acceptor), debug))
}

#[tokio::main]
async fn main() {
    logging::init();
    let opt = Opt::from_args();

    let relay = match build(&opt) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = relay.run(&opt.in_hostport).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
