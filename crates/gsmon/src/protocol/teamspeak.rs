//! TeamSpeak 3 ServerQuery over its plain-text TCP interface.
//!
//! The query port comes from the query's extra data; the resolved port is
//! the voice port, which is what SRV records advertise.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::{Protocol, Reply, non_empty};
use crate::error::{QueryFailure, Result};
use crate::resolver::{Endpoint, SrvService};

const DEFAULT_QUERY_PORT: u16 = 10011;
const VOICE_CLIENT: &str = "0";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Extra {
    query_port: u16,
}

impl Default for Extra {
    fn default() -> Self {
        Self {
            query_port: DEFAULT_QUERY_PORT,
        }
    }
}

fn parse_extra(extra: &str) -> Result<Extra> {
    if extra.trim().is_empty() {
        return Ok(Extra::default());
    }
    serde_json::from_str(extra)
        .map_err(|e| QueryFailure::malformed(format!("invalid TeamSpeak settings: {e}")))
}

pub struct Teamspeak3Protocol;

#[async_trait]
impl Protocol for Teamspeak3Protocol {
    fn srv(&self) -> Option<SrvService> {
        Some(SrvService::new("_ts3._udp"))
    }

    async fn probe(&self, endpoint: &Endpoint, extra: &str, timeout: Duration) -> Result<Reply> {
        let extra = parse_extra(extra)?;
        let query_addr = SocketAddr::new(endpoint.addr.ip(), extra.query_port);
        let voice_port = endpoint.addr.port();

        let exchange = async {
            let stream = TcpStream::connect(query_addr).await?;
            let mut session = Session::open(stream).await?;
            session.command(&format!("use port={voice_port}")).await?;
            let info = session.command("serverinfo").await?;
            let clients = session.command("clientlist").await?;
            session.quit().await;
            Ok::<_, QueryFailure>((info, clients))
        };
        let (info, clients) = tokio::time::timeout(timeout, exchange).await??;

        let info = info.into_iter().next().unwrap_or_default();
        let count = |key: &str| info.get(key).and_then(|v| v.parse::<u32>().ok());
        let players = clients
            .into_iter()
            .filter(|c| c.get("client_type").map(String::as_str) == Some(VOICE_CLIENT))
            .filter_map(|mut c| c.remove("client_nickname"))
            .filter_map(non_empty)
            .collect();

        Ok(Reply {
            title: info.get("virtualserver_name").and_then(non_empty),
            version: info.get("virtualserver_version").and_then(non_empty),
            max_players: count("virtualserver_maxclients"),
            num_players: count("virtualserver_clientsonline"),
            players,
            ..Reply::default()
        })
    }
}

type Record = HashMap<String, String>;

struct Session<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Consumes the `TS3` banner and welcome text.
    async fn open(stream: S) -> Result<Self> {
        let mut session = Self {
            stream: BufReader::new(stream),
        };
        let banner = session.read_line().await?;
        if banner != "TS3" {
            return Err(QueryFailure::malformed("not a TeamSpeak 3 query port"));
        }
        let _welcome = session.read_line().await?;
        Ok(session)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.stream.read_line(&mut line).await? == 0 {
                return Err(QueryFailure::malformed("connection closed mid-reply"));
            }
            // Replies end lines with "\n\r", so strip both sides.
            let trimmed = line.trim_matches(|c: char| c == '\r' || c == '\n');
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }

    async fn command(&mut self, command: &str) -> Result<Vec<Record>> {
        self.stream
            .get_mut()
            .write_all(format!("{command}\n").as_bytes())
            .await?;

        let mut records = Vec::new();
        loop {
            let line = self.read_line().await?;
            if let Some(status) = line.strip_prefix("error ") {
                let status = parse_record(status);
                let id = status.get("id").map(String::as_str).unwrap_or("0");
                if id != "0" {
                    let msg = status.get("msg").cloned().unwrap_or_default();
                    return Err(QueryFailure::malformed(format!(
                        "`{command}` failed with error {id}: {msg}"
                    )));
                }
                return Ok(records);
            }
            records.extend(line.split('|').map(parse_record));
        }
    }

    async fn quit(&mut self) {
        if let Err(e) = self.stream.get_mut().write_all(b"quit\n").await {
            debug!(error = %e, "Failed to close ServerQuery session");
        }
    }
}

/// Parses `key=value key2=value2` with ServerQuery escaping.
fn parse_record(line: &str) -> Record {
    line.split(' ')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), unescape(value)),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('p') => out.push('|'),
            Some('/') => out.push('/'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\x0B'),
            Some('f') => out.push('\x0C'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
