//! IMAP message source: raw IMAP over rustls, one session per fetch.
//!
//! Uses `UID SEARCH SINCE` to find candidate messages and
//! `UID FETCH <uid> BODY.PEEK[]` so the mailbox's `\Seen` flags are left
//! alone. SINCE has day granularity; messages already handled are weeded
//! out by the processed ledger, not here.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::channels::mime::parse_raw;
use crate::config::ImapConfig;
use crate::error::FetchError;
use crate::pipeline::{Message, MessageSource};

const SOURCE_NAME: &str = "imap";

/// Largest literal accepted from the server.
const MAX_LITERAL_BYTES: usize = 50 * 1024 * 1024;

pub struct ImapSource {
    config: ImapConfig,
    closed: AtomicBool,
}

impl ImapSource {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MessageSource for ImapSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_new(&self, since: DateTime<Utc>) -> Result<Vec<Message>, FetchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FetchError::Closed {
                source_name: SOURCE_NAME.into(),
            });
        }

        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let stream = connect_tls(&config)?;
            fetch_since(&mut ImapSession::new(stream), &config, since)
        })
        .await
        .map_err(|e| unreachable(format!("IMAP fetch task panicked: {e}")))?
    }

    async fn close(&self) -> Result<(), FetchError> {
        self.closed.store(true, Ordering::Release);
        debug!("IMAP source closed");
        Ok(())
    }
}

// ── Session ─────────────────────────────────────────────────────────

fn unreachable(reason: impl Into<String>) -> FetchError {
    FetchError::Unreachable {
        source_name: SOURCE_NAME.into(),
        reason: reason.into(),
    }
}

fn invalid(reason: impl Into<String>) -> FetchError {
    FetchError::InvalidResponse {
        source_name: SOURCE_NAME.into(),
        reason: reason.into(),
    }
}

/// Open a TLS stream to the IMAP server.
fn connect_tls(
    config: &ImapConfig,
) -> Result<rustls::StreamOwned<rustls::ClientConnection, TcpStream>, FetchError> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .map_err(|e| unreachable(format!("connect {}:{}: {e}", config.host, config.port)))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))
        .map_err(|e| unreachable(e.to_string()))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
        .map_err(|e| unreachable(format!("invalid IMAP host name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| unreachable(format!("TLS setup failed: {e}")))?;

    Ok(rustls::StreamOwned::new(conn, tcp))
}

/// Response to one tagged command.
#[derive(Debug, Default)]
struct Response {
    untagged: Vec<String>,
    literals: Vec<Vec<u8>>,
    status: String,
}

impl Response {
    fn is_ok(&self) -> bool {
        self.status
            .split_whitespace()
            .nth(1)
            .is_some_and(|s| s.eq_ignore_ascii_case("OK"))
    }
}

/// Minimal tagged-command IMAP client over any byte stream.
struct ImapSession<S> {
    stream: S,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            next_tag: 1,
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, FetchError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(unreachable("IMAP connection closed")),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) => return Err(unreachable(format!("IMAP read failed: {e}"))),
            }
        }
    }

    fn greeting(&mut self) -> Result<(), FetchError> {
        let line = self.read_line()?;
        if !line.starts_with(b"* OK") && !line.starts_with(b"* PREAUTH") {
            return Err(invalid(format!(
                "unexpected greeting: {}",
                String::from_utf8_lossy(&line).trim_end()
            )));
        }
        Ok(())
    }

    fn command(&mut self, cmd: &str) -> Result<Response, FetchError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let full = format!("{tag} {cmd}\r\n");
        self.stream
            .write_all(full.as_bytes())
            .and_then(|_| self.stream.flush())
            .map_err(|e| unreachable(format!("IMAP write failed: {e}")))?;

        let prefix = format!("{tag} ");
        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(size) = literal_size(&line) {
                if size > MAX_LITERAL_BYTES {
                    return Err(invalid(format!(
                        "IMAP literal of {size} bytes exceeds {MAX_LITERAL_BYTES} byte limit"
                    )));
                }
                let mut literal = vec![0u8; size];
                self.stream
                    .read_exact(&mut literal)
                    .map_err(|e| unreachable(format!("IMAP literal read failed: {e}")))?;
                response.literals.push(literal);
                continue;
            }

            let text = String::from_utf8_lossy(&line).trim_end().to_string();
            if text.starts_with(&prefix) {
                response.status = text;
                return Ok(response);
            }
            response.untagged.push(text);
        }
    }
}

/// `{123}` at the end of a line announces a literal of that many bytes.
fn literal_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?.trim_end();
    let open = line.rfind('{')?;
    let inner = line[open + 1..].strip_suffix('}')?;
    inner.parse().ok()
}

/// Quote a string for use as an IMAP quoted argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// IMAP date (`dd-Mon-yyyy`) for SEARCH SINCE.
fn imap_date(at: DateTime<Utc>) -> String {
    at.format("%d-%b-%Y").to_string()
}

fn fetch_since<S: Read + Write>(
    session: &mut ImapSession<S>,
    config: &ImapConfig,
    since: DateTime<Utc>,
) -> Result<Vec<Message>, FetchError> {
    session.greeting()?;

    let login = session.command(&format!(
        "LOGIN {} {}",
        quote(&config.username),
        quote(config.password.expose_secret())
    ))?;
    if !login.is_ok() {
        return Err(FetchError::AuthFailed {
            source_name: SOURCE_NAME.into(),
            reason: login.status,
        });
    }

    let select = session.command(&format!("SELECT {}", quote(&config.mailbox)))?;
    if !select.is_ok() {
        return Err(invalid(format!("SELECT {} failed: {}", config.mailbox, select.status)));
    }

    let search = session.command(&format!("UID SEARCH SINCE {}", imap_date(since)))?;
    if !search.is_ok() {
        return Err(invalid(format!("SEARCH failed: {}", search.status)));
    }
    let uids: Vec<String> = search
        .untagged
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect();
    debug!(count = uids.len(), mailbox = %config.mailbox, "IMAP search complete");

    let mut messages = Vec::with_capacity(uids.len());
    for uid in &uids {
        let fetch = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        let Some(raw) = fetch.literals.first().filter(|_| fetch.is_ok()) else {
            warn!(uid = %uid, status = %fetch.status, "IMAP fetch returned no body");
            continue;
        };
        match parse_raw(raw, &format!("imap-{}-{uid}", config.mailbox)) {
            Some(message) => messages.push(message),
            None => warn!(uid = %uid, "Failed to parse IMAP message"),
        }
    }

    if let Err(e) = session.command("LOGOUT") {
        debug!(error = %e, "IMAP logout failed");
    }

    Ok(messages)
}
