//! Game query protocols.
//!
//! Every supported game implements [`Protocol`]: one probe against a
//! resolved endpoint, producing a normalized [`Reply`]. Callers look
//! protocols up by [`ProtocolKind`] through a [`ProtocolTable`] and never
//! depend on a concrete variant.

mod bedrock;
mod fivem;
mod minecraft;
mod source;
mod teamspeak;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use bedrock::BedrockProtocol;
pub use fivem::FivemProtocol;
pub use minecraft::MinecraftJavaProtocol;
pub use source::SourceProtocol;
pub use teamspeak::Teamspeak3Protocol;

use crate::error::{QueryFailure, Result};
use crate::model::ProtocolKind;
use crate::resolver::{Endpoint, SrvService};

/// What a server told us about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub title: Option<String>,
    /// Address shown to users; the caller fills in the configured address
    /// when a protocol leaves this empty.
    pub address: Option<String>,
    pub thumbnail: Option<Vec<u8>>,
    pub game: Option<String>,
    pub map: Option<String>,
    pub version: Option<String>,
    pub max_players: Option<u32>,
    pub num_players: Option<u32>,
    pub players: Vec<String>,
}

#[async_trait]
pub trait Protocol: Send + Sync {
    /// SRV service consulted when a query leaves its port at zero.
    fn srv(&self) -> Option<SrvService> {
        None
    }

    /// Sends one probe and parses the reply. `extra` is the query's opaque
    /// protocol specific configuration.
    async fn probe(&self, endpoint: &Endpoint, extra: &str, timeout: Duration) -> Result<Reply>;
}

/// Protocol implementations keyed by their tag.
#[derive(Clone, Default)]
pub struct ProtocolTable {
    protocols: HashMap<ProtocolKind, Arc<dyn Protocol>>,
}

impl ProtocolTable {
    /// Table with every built-in protocol registered.
    pub fn standard(timeout: Duration) -> anyhow::Result<Self> {
        let source = Arc::new(SourceProtocol::new());
        let mut table = Self::default();
        table
            .register(
                ProtocolKind::Arma3,
                Arc::new(SourceProtocol::with_srv(
                    SrvService::new("_arma3._udp").with_port_offset(1),
                )),
            )
            .register(ProtocolKind::ArmaReforger, source.clone())
            .register(ProtocolKind::ProjectZomboid, source.clone())
            .register(ProtocolKind::Source, source)
            .register(ProtocolKind::MinecraftJava, Arc::new(MinecraftJavaProtocol))
            .register(ProtocolKind::MinecraftBedrock, Arc::new(BedrockProtocol))
            .register(ProtocolKind::Fivem, Arc::new(FivemProtocol::new(timeout)?))
            .register(ProtocolKind::Teamspeak3, Arc::new(Teamspeak3Protocol));
        Ok(table)
    }

    pub fn register(&mut self, kind: ProtocolKind, protocol: Arc<dyn Protocol>) -> &mut Self {
        self.protocols.insert(kind, protocol);
        self
    }

    pub fn get(&self, kind: ProtocolKind) -> Option<&Arc<dyn Protocol>> {
        self.protocols.get(&kind)
    }
}

/// Little helper for walking binary replies.
pub(crate) struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| QueryFailure::malformed("reply ended early"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn i32_le(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64_be(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub(crate) fn f32_le(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    /// NUL terminated string, decoded lossily.
    pub(crate) fn cstring(&mut self) -> Result<String> {
        let rest = self.remaining();
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| QueryFailure::malformed("unterminated string"))?;
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(text)
    }
}

/// Treats empty or whitespace-only strings as absent.
pub(crate) fn non_empty(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
