use chrono::Local;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::metadata::LevelFilter;

/// Diagnostic sink for relay transitions (LOGIN, MAIL FROM, ...).
///
/// Chosen once at startup; callers never check a verbosity flag themselves.
pub trait RelayLog: Send + Sync {
    fn step(&self, step: &str, detail: fmt::Arguments<'_>);
}

/// Emits every step as a `tracing` event in the current connection span.
pub struct TracingLog;

impl RelayLog for TracingLog {
    fn step(&self, step: &str, detail: fmt::Arguments<'_>) {
        tracing::info!(step, "{}", detail);
    }
}

/// Discards everything.
pub struct NullLog;

impl RelayLog for NullLog {
    fn step(&self, _step: &str, _detail: fmt::Arguments<'_>) {}
}

/// Installs the process-wide `tracing` subscriber. The level comes from
/// `LOG_LEVEL`, defaulting to `info`.
pub fn init() {
    let default = LevelFilter::INFO;
    let level = std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(&level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    });

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
}

/// Converts non printable characters to escape sequences
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Client => "C:",
            Direction::Server => "S:",
        }
    }
}

/// Append-only file holding the raw client conversation.
pub struct DebugSink {
    writer: Mutex<BufWriter<File>>,
}

impl DebugSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub async fn record(&self, peer: &SocketAddr, direction: Direction, line: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let mut writer = self.writer.lock().await;
        for part in line.trim_end_matches("\r\n").split("\r\n") {
            let entry = format!("{} {} {} {}\n", timestamp, peer, direction.tag(), safe_log_string(part));
            if let Err(e) = writer.write_all(entry.as_bytes()) {
                tracing::warn!(error = %e, "debug sink write failed");
                return;
            }
        }
        let _ = writer.flush();
    }
}
