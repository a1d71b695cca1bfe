//! Minecraft: Java Edition server list ping.
//!
//! <https://minecraft.wiki/w/Java_Edition_protocol/Server_List_Ping>

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Protocol, Reply, non_empty};
use crate::error::{QueryFailure, Result};
use crate::resolver::{Endpoint, SrvService};

const MAX_RESPONSE_LEN: usize = 1 << 20;
const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";
const PNG_DATA_URI: &str = "data:image/png;base64,";

static FORMATTING_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("§.").expect("formatting code pattern is valid"));

pub struct MinecraftJavaProtocol;

#[async_trait]
impl Protocol for MinecraftJavaProtocol {
    fn srv(&self) -> Option<SrvService> {
        Some(SrvService::new("_minecraft._tcp"))
    }

    async fn probe(&self, endpoint: &Endpoint, _extra: &str, timeout: Duration) -> Result<Reply> {
        let json = tokio::time::timeout(timeout, ping(endpoint)).await??;
        let status: StatusResponse = serde_json::from_str(&json)
            .map_err(|e| QueryFailure::malformed(format!("invalid status JSON: {e}")))?;
        Ok(status.into_reply())
    }
}

async fn ping(endpoint: &Endpoint) -> Result<String> {
    let mut stream = TcpStream::connect(endpoint.addr).await?;

    let mut handshake = Vec::new();
    write_varint(&mut handshake, 0x00);
    write_varint(&mut handshake, -1);
    write_string(&mut handshake, &endpoint.hostname);
    handshake.extend_from_slice(&endpoint.addr.port().to_be_bytes());
    write_varint(&mut handshake, 1);

    let mut request = Vec::new();
    write_frame(&mut request, &handshake);
    write_frame(&mut request, &[0x00]);
    stream.write_all(&request).await?;

    let _frame_len = read_varint(&mut stream).await?;
    let packet_id = read_varint(&mut stream).await?;
    if packet_id != 0x00 {
        return Err(QueryFailure::malformed(format!(
            "unexpected packet id {packet_id}"
        )));
    }

    let len = usize::try_from(read_varint(&mut stream).await?)
        .ok()
        .filter(|len| *len <= MAX_RESPONSE_LEN)
        .ok_or_else(|| QueryFailure::malformed("bad status length"))?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    String::from_utf8(body).map_err(|_| QueryFailure::malformed("status is not UTF-8"))
}

fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

fn write_frame(buf: &mut Vec<u8>, packet: &[u8]) {
    write_varint(buf, packet.len() as i32);
    buf.extend_from_slice(packet);
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32> {
    let mut value = 0u32;
    for shift in (0..35).step_by(7) {
        let byte = reader.read_u8().await?;
        value |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(QueryFailure::malformed("VarInt is too long"))
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    version: Option<Version>,
    players: Option<Players>,
    description: Option<Description>,
    favicon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Version {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Players {
    max: u32,
    online: u32,
    sample: Vec<Sample>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Sample {
    name: String,
    id: String,
}

/// The MOTD is either a plain string or a chat component tree.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Description {
    Text(String),
    Component(Component),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Component {
    text: String,
    extra: Vec<Description>,
}

impl Description {
    fn flatten(&self, out: &mut String) {
        match self {
            Description::Text(text) => out.push_str(text),
            Description::Component(component) => {
                out.push_str(&component.text);
                for child in &component.extra {
                    child.flatten(out);
                }
            }
        }
    }
}

impl StatusResponse {
    fn into_reply(self) -> Reply {
        let title = self.description.and_then(|description| {
            let mut motd = String::new();
            description.flatten(&mut motd);
            let plain = FORMATTING_CODE.replace_all(&motd, "");
            // Only the first MOTD line makes a sensible title.
            plain.lines().next().and_then(non_empty)
        });

        let thumbnail = self
            .favicon
            .as_deref()
            .and_then(|favicon| favicon.strip_prefix(PNG_DATA_URI))
            .and_then(|data| STANDARD.decode(data.replace('\n', "")).ok());

        let players = self.players.unwrap_or_default();
        let names = players
            .sample
            .into_iter()
            .filter(|p| !p.id.is_empty() && p.id != NIL_UUID)
            .filter_map(|p| non_empty(p.name))
            .collect();

        Reply {
            title,
            thumbnail,
            version: self.version.and_then(|v| non_empty(v.name)),
            max_players: Some(players.max),
            num_players: Some(players.online),
            players: names,
            ..Reply::default()
        }
    }
}
