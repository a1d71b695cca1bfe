//! Minecraft: Bedrock Edition RakNet unconnected ping.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{PacketReader, Protocol, Reply, non_empty};
use crate::error::{QueryFailure, Result};
use crate::resolver::Endpoint;

const UNCONNECTED_PING: u8 = 0x01;
const UNCONNECTED_PONG: u8 = 0x1C;
const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xFF, 0xFF, 0x00, 0xFE, 0xFE, 0xFE, 0xFE, 0xFD, 0xFD, 0xFD, 0xFD, 0x12, 0x34, 0x56, 0x78,
];
const CLIENT_GUID: i64 = 0x6773_6D6F_6E00_0001;

pub struct BedrockProtocol;

#[async_trait]
impl Protocol for BedrockProtocol {
    async fn probe(&self, endpoint: &Endpoint, _extra: &str, timeout: Duration) -> Result<Reply> {
        let pong = tokio::time::timeout(timeout, ping(endpoint.addr)).await??;
        parse_pong(&pong)
    }
}

async fn ping(addr: SocketAddr) -> Result<Vec<u8>> {
    let bind = if addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    socket.send(&ping_packet()).await?;

    let mut buf = vec![0u8; 2048];
    let n = socket.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

fn ping_packet() -> Vec<u8> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();

    let mut packet = Vec::with_capacity(33);
    packet.push(UNCONNECTED_PING);
    packet.extend_from_slice(&millis.to_be_bytes());
    packet.extend_from_slice(&OFFLINE_MAGIC);
    packet.extend_from_slice(&CLIENT_GUID.to_be_bytes());
    packet
}

/// Parses `MCPE;motd;protocol;version;online;max;guid;motd2;gamemode;...`.
fn parse_pong(packet: &[u8]) -> Result<Reply> {
    let mut reader = PacketReader::new(packet);
    if reader.u8()? != UNCONNECTED_PONG {
        return Err(QueryFailure::malformed("expected unconnected pong"));
    }
    let _time = reader.i64_be()?;
    let _server_guid = reader.i64_be()?;
    if reader.take(OFFLINE_MAGIC.len())? != OFFLINE_MAGIC {
        return Err(QueryFailure::malformed("bad offline message magic"));
    }
    let len = usize::from(reader.u16_be()?);
    let advertisement = String::from_utf8_lossy(reader.take(len)?).into_owned();

    let fields: Vec<&str> = advertisement.split(';').collect();
    if fields.len() < 6 || !matches!(fields[0], "MCPE" | "MCEE") {
        return Err(QueryFailure::malformed("bad server advertisement"));
    }
    let count = |index: usize| {
        fields[index]
            .trim()
            .parse::<u32>()
            .map_err(|_| QueryFailure::malformed("bad player count"))
    };

    Ok(Reply {
        title: non_empty(fields[1]),
        version: non_empty(fields[3]),
        num_players: Some(count(4)?),
        max_players: Some(count(5)?),
        game: fields.get(8).and_then(non_empty),
        ..Reply::default()
    })
}
