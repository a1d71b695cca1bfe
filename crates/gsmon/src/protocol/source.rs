//! Valve A2S server queries over UDP.
//!
//! <https://developer.valvesoftware.com/wiki/Server_queries>

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{PacketReader, Protocol, Reply, non_empty};
use crate::error::{QueryFailure, Result};
use crate::resolver::{Endpoint, SrvService};

const SINGLE_PACKET: i32 = -1;
const SPLIT_PACKET: i32 = -2;

const A2S_INFO: u8 = 0x54;
const A2S_PLAYER: u8 = 0x55;
const S2C_CHALLENGE: u8 = 0x41;
const S2A_INFO: u8 = 0x49;
const S2A_PLAYER: u8 = 0x44;

const NO_CHALLENGE: [u8; 4] = [0xFF; 4];
const MAX_CHALLENGES: usize = 3;
const MAX_PACKET: usize = 1400;

pub struct SourceProtocol {
    srv: Option<SrvService>,
}

impl SourceProtocol {
    pub fn new() -> Self {
        Self { srv: None }
    }

    pub fn with_srv(srv: SrvService) -> Self {
        Self { srv: Some(srv) }
    }
}

impl Default for SourceProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Protocol for SourceProtocol {
    fn srv(&self) -> Option<SrvService> {
        self.srv
    }

    async fn probe(&self, endpoint: &Endpoint, _extra: &str, timeout: Duration) -> Result<Reply> {
        tokio::time::timeout(timeout, query(endpoint.addr)).await?
    }
}

async fn query(addr: SocketAddr) -> Result<Reply> {
    let bind = if addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };

    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let info = request(&socket, info_request, S2A_INFO).await?;
    let mut reply = parse_info(&info)?;

    let players = request(&socket, player_request, S2A_PLAYER).await?;
    reply.players = parse_players(&players)?;

    Ok(reply)
}

fn info_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(29);
    packet.extend_from_slice(&SINGLE_PACKET.to_le_bytes());
    packet.push(A2S_INFO);
    packet.extend_from_slice(b"Source Engine Query\0");
    if let Some(challenge) = challenge {
        packet.extend_from_slice(&challenge);
    }
    packet
}

fn player_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(9);
    packet.extend_from_slice(&SINGLE_PACKET.to_le_bytes());
    packet.push(A2S_PLAYER);
    packet.extend_from_slice(&challenge.unwrap_or(NO_CHALLENGE));
    packet
}

/// Sends a request, answering challenges until the expected reply arrives.
/// Returns the payload following the reply's type byte.
async fn request(
    socket: &UdpSocket,
    build: fn(Option<[u8; 4]>) -> Vec<u8>,
    expected: u8,
) -> Result<Vec<u8>> {
    let mut challenge = None;
    for _ in 0..=MAX_CHALLENGES {
        socket.send(&build(challenge)).await?;
        let payload = recv_payload(socket).await?;
        let (&kind, body) = payload
            .split_first()
            .ok_or_else(|| QueryFailure::malformed("empty reply"))?;

        match kind {
            S2C_CHALLENGE => {
                let mut reader = PacketReader::new(body);
                let mut value = [0u8; 4];
                value.copy_from_slice(reader.take(4)?);
                debug!("Received A2S challenge");
                challenge = Some(value);
            }
            kind if kind == expected => return Ok(body.to_vec()),
            other => {
                return Err(QueryFailure::malformed(format!(
                    "unexpected reply type {other:#04x}"
                )));
            }
        }
    }

    Err(QueryFailure::malformed(
        "Server responded with too many challenges",
    ))
}

/// Receives one logical reply, reassembling split packets. The returned
/// payload starts at the reply's type byte.
async fn recv_payload(socket: &UdpSocket) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_PACKET * 2];
    let n = socket.recv(&mut buf).await?;
    let mut reader = PacketReader::new(&buf[..n]);

    match reader.i32_le()? {
        SINGLE_PACKET => Ok(reader.remaining().to_vec()),
        SPLIT_PACKET => {
            let mut assembler = SplitAssembler::default();
            let mut done = assembler.push(&buf[..n])?;
            while done.is_none() {
                let n = socket.recv(&mut buf).await?;
                done = assembler.push(&buf[..n])?;
            }
            let joined = done.unwrap_or_default();
            let mut reader = PacketReader::new(&joined);
            if reader.i32_le()? != SINGLE_PACKET {
                return Err(QueryFailure::malformed("split reply missing header"));
            }
            Ok(reader.remaining().to_vec())
        }
        other => Err(QueryFailure::malformed(format!(
            "unexpected packet header {other}"
        ))),
    }
}

/// Collects the fragments of one split reply.
#[derive(Default)]
struct SplitAssembler {
    id: Option<i32>,
    fragments: Vec<Option<Vec<u8>>>,
}

impl SplitAssembler {
    /// Adds a raw datagram; returns the joined reply once every fragment is in.
    fn push(&mut self, datagram: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut reader = PacketReader::new(datagram);
        if reader.i32_le()? != SPLIT_PACKET {
            return Err(QueryFailure::malformed("expected split packet"));
        }
        let id = reader.i32_le()?;
        if id < 0 {
            return Err(QueryFailure::malformed(
                "compressed split replies are not supported",
            ));
        }
        let total = usize::from(reader.u8()?);
        let number = usize::from(reader.u8()?);
        let _size = reader.u16_le()?;

        if total == 0 || number >= total {
            return Err(QueryFailure::malformed("bad split packet numbering"));
        }
        match self.id {
            None => {
                self.id = Some(id);
                self.fragments = vec![None; total];
            }
            Some(current) if current != id || self.fragments.len() != total => {
                return Err(QueryFailure::malformed("mismatched split packet"));
            }
            Some(_) => {}
        }

        self.fragments[number] = Some(reader.remaining().to_vec());
        if self.fragments.iter().any(Option::is_none) {
            return Ok(None);
        }
        Ok(Some(self.fragments.iter().flatten().flatten().copied().collect()))
    }
}

fn parse_info(body: &[u8]) -> Result<Reply> {
    let mut reader = PacketReader::new(body);
    let _protocol = reader.u8()?;
    let name = reader.cstring()?;
    let map = reader.cstring()?;
    let _folder = reader.cstring()?;
    let game = reader.cstring()?;
    let _app_id = reader.u16_le()?;
    let players = reader.u8()?;
    let max_players = reader.u8()?;
    let _bots = reader.u8()?;
    let _server_type = reader.u8()?;
    let _environment = reader.u8()?;
    let _visibility = reader.u8()?;
    let _vac = reader.u8()?;
    let version = reader.cstring()?;

    Ok(Reply {
        title: non_empty(name),
        map: non_empty(map),
        game: non_empty(game),
        version: non_empty(version),
        max_players: Some(u32::from(max_players)),
        num_players: Some(u32::from(players)),
        ..Reply::default()
    })
}

fn parse_players(body: &[u8]) -> Result<Vec<String>> {
    let mut reader = PacketReader::new(body);
    let count = reader.u8()?;
    let mut names = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let _index = reader.u8()?;
        let name = reader.cstring()?;
        let _score = reader.i32_le()?;
        let _duration = reader.f32_le()?;
        // Players still connecting have no name yet.
        if let Some(name) = non_empty(name) {
            names.push(name);
        }
    }
    Ok(names)
}
