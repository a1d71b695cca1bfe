//! ユニットテストで共有するフェイク。

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::alert::{AlertEvent, AlertSink};
use crate::error::Result;
use crate::model::{HistoryPoint, ProtocolKind, Query, QueryId, Status, StatusId};
use crate::poller::{PollOutcome, PollReport};
use crate::protocol::{Protocol, Reply};
use crate::resolver::{DnsLookup, Endpoint, SrvService};

/// 問い合わせを全て記録するメモリ上の DNS ゾーン。
#[derive(Default)]
pub(crate) struct FakeDns {
    pub a: HashMap<String, Ipv4Addr>,
    pub aaaa: HashMap<String, Ipv6Addr>,
    pub srv: HashMap<String, (String, u16)>,
    lookups: Mutex<Vec<String>>,
}

impl FakeDns {
    pub(crate) fn with_a(mut self, host: &str, ip: [u8; 4]) -> Self {
        self.a.insert(host.to_string(), Ipv4Addr::from(ip));
        self
    }

    pub(crate) fn with_aaaa(mut self, host: &str, ip: Ipv6Addr) -> Self {
        self.aaaa.insert(host.to_string(), ip);
        self
    }

    pub(crate) fn with_srv(mut self, name: &str, target: &str, port: u16) -> Self {
        self.srv.insert(name.to_string(), (target.to_string(), port));
        self
    }

    pub(crate) fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }

    fn log(&self, entry: String) {
        self.lookups.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl DnsLookup for FakeDns {
    async fn ipv4(&self, host: &str) -> Result<Option<Ipv4Addr>> {
        self.log(format!("A {host}"));
        Ok(self.a.get(host).copied())
    }

    async fn ipv6(&self, host: &str) -> Result<Option<Ipv6Addr>> {
        self.log(format!("AAAA {host}"));
        Ok(self.aaaa.get(host).copied())
    }

    async fn srv(&self, name: &str) -> Result<Option<(String, u16)>> {
        self.log(format!("SRV {name}"));
        Ok(self.srv.get(name).cloned())
    }
}

/// 用意した結果を順に返し、その後はフォールバックを返し続けるプロトコル。
pub(crate) struct ScriptedProtocol {
    script: Mutex<VecDeque<Result<Reply>>>,
    fallback: Result<Reply>,
    srv: Option<SrvService>,
    calls: AtomicUsize,
}

impl ScriptedProtocol {
    pub(crate) fn always(outcome: Result<Reply>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: outcome,
            srv: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn then(self, outcome: Result<Reply>) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Protocol for ScriptedProtocol {
    fn srv(&self) -> Option<SrvService> {
        self.srv
    }

    async fn probe(&self, _endpoint: &Endpoint, _extra: &str, _timeout: Duration) -> Result<Reply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// 決して応答しないプロトコル。
pub(crate) struct SilentProtocol;

#[async_trait]
impl Protocol for SilentProtocol {
    async fn probe(&self, _endpoint: &Endpoint, _extra: &str, _timeout: Duration) -> Result<Reply> {
        std::future::pending().await
    }
}

/// 配送されたアラートを全て保持する送り先。
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub(crate) fn online(players: &[&str]) -> Result<Reply> {
    Ok(Reply {
        title: Some("Test Server".to_string()),
        max_players: Some(32),
        num_players: Some(players.len() as u32),
        players: players.iter().map(|p| p.to_string()).collect(),
        ..Reply::default()
    })
}

pub(crate) fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

pub(crate) fn status(id: i64) -> Status {
    Status {
        id: StatusId(id),
        guild_id: 1000,
        label: format!("status-{id}"),
        enabled_at: Some(t(-60)),
        title: None,
        address: None,
        thumbnail: None,
        game: None,
        map: None,
        version: None,
    }
}

pub(crate) fn query(id: i64, status: i64, kind: ProtocolKind, priority: u32) -> Query {
    Query {
        id: QueryId(id),
        status_id: StatusId(status),
        host: "127.0.0.1".to_string(),
        port: 25565 + id as u16,
        kind,
        priority,
        enabled_at: Some(t(-60)),
        failed_at: None,
        extra: String::new(),
    }
}

/// `point` だけを持つ最小のレポート。
pub(crate) fn report(status: i64, point: HistoryPoint) -> PollReport {
    PollReport {
        outcome: PollOutcome {
            status_id: StatusId(status),
            guild_id: 1000,
            label: format!("status-{status}"),
            online: point.online,
            down: point.down,
            intermediary: false,
            query_id: None,
            title: None,
            address: None,
            game: None,
            map: None,
            version: None,
            max_players: None,
            num_players: None,
            players: Vec::new(),
            failure: None,
        },
        point,
        query_changes: Vec::new(),
        cache: None,
        alerts: Vec::new(),
    }
}
