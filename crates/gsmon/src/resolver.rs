//! 設定されたホストとポートをソケットアドレスに解決する。
//! ポートが 0 の場合は SRV レコードをたどる。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use tracing::debug;

use crate::error::{QueryFailure, Result};
use crate::model::ProtocolKind;

/// プロトコルが使う SRV サービス (例: `_minecraft._tcp`)。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrvService {
    pub name: &'static str,
    /// SRV のポートに加算する。Arma 3 はゲームポート +1 でクエリに応答する
    pub port_offset: u16,
}

impl SrvService {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            port_offset: 0,
        }
    }

    pub const fn with_port_offset(mut self, offset: u16) -> Self {
        self.port_offset = offset;
        self
    }
}

/// リゾルバが使う DNS 問い合わせ。どのメソッドも最初のレコードを返し、
/// 該当するレコードが無ければ `None` を返す。
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn ipv4(&self, host: &str) -> Result<Option<Ipv4Addr>>;
    async fn ipv6(&self, host: &str) -> Result<Option<Ipv6Addr>>;
    async fn srv(&self, name: &str) -> Result<Option<(String, u16)>>;
}

/// システムのネームサーバーを使う [`DnsLookup`]。
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    pub fn from_system_conf(timeout: Duration) -> anyhow::Result<Self> {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .context("Failed to read system DNS configuration")?;
        opts.timeout = timeout;
        opts.attempts = 1;
        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn ipv4(&self, host: &str) -> Result<Option<Ipv4Addr>> {
        match self.resolver.ipv4_lookup(host).await {
            Ok(lookup) => Ok(lookup.iter().next().map(|record| record.0)),
            Err(e) => missing_or_failure(e),
        }
    }

    async fn ipv6(&self, host: &str) -> Result<Option<Ipv6Addr>> {
        match self.resolver.ipv6_lookup(host).await {
            Ok(lookup) => Ok(lookup.iter().next().map(|record| record.0)),
            Err(e) => missing_or_failure(e),
        }
    }

    async fn srv(&self, name: &str) -> Result<Option<(String, u16)>> {
        match self.resolver.srv_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().next().map(|record| {
                let target = record.target().to_utf8();
                (target.trim_end_matches('.').to_string(), record.port())
            })),
            Err(e) => missing_or_failure(e),
        }
    }
}

fn missing_or_failure<T>(err: ResolveError) -> Result<Option<T>> {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
        ResolveErrorKind::Timeout => Err(QueryFailure::Timeout),
        ResolveErrorKind::NoConnections => Err(QueryFailure::unreachable(
            "DNS nameservers unavailable",
        )),
        _ => Err(QueryFailure::unreachable(err)),
    }
}

/// 問い合わせ先の具体的なアドレス。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    /// 解決元のホスト名 (SRV をたどった後)
    pub hostname: String,
}

#[derive(Clone)]
pub struct Resolver {
    dns: Arc<dyn DnsLookup>,
}

impl Resolver {
    pub fn new(dns: Arc<dyn DnsLookup>) -> Self {
        Self { dns }
    }

    /// `host:port` を解決する。`port` が 0 の場合だけ `srv` を引く。
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        kind: ProtocolKind,
        srv: Option<SrvService>,
    ) -> Result<Endpoint> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            if port == 0 {
                return Err(QueryFailure::SrvUnsupported(kind));
            }
            return Ok(Endpoint {
                addr: SocketAddr::new(ip, port),
                hostname: host.to_string(),
            });
        }

        if port != 0 {
            return self.lookup_address(host, port).await;
        }

        let Some(service) = srv else {
            return Err(QueryFailure::SrvUnsupported(kind));
        };

        let name = format!("{}.{}", service.name, host);
        let Some((target, target_port)) = self.dns.srv(&name).await? else {
            debug!(%name, "No SRV record found");
            return Err(QueryFailure::NameNotFound);
        };

        debug!(%name, %target, port = target_port, "Resolved SRV record");
        let port = target_port.saturating_add(service.port_offset);
        self.lookup_address(&target, port).await
    }

    async fn lookup_address(&self, host: &str, port: u16) -> Result<Endpoint> {
        let ip = match self.dns.ipv4(host).await? {
            Some(ip) => IpAddr::V4(ip),
            None => match self.dns.ipv6(host).await? {
                Some(ip) => IpAddr::V6(ip),
                None => return Err(QueryFailure::NameNotFound),
            },
        };

        Ok(Endpoint {
            addr: SocketAddr::new(ip, port),
            hostname: host.to_string(),
        })
    }
}
