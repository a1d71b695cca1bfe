//! ポーラーが出すアラートイベントと、その配送先。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::QueryFailure;
use crate::model::{ProtocolKind, Query, QueryId, Status, StatusId};

mod discord;

pub use discord::DiscordSink;

/// クエリが無効化される理由。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisableReason {
    DnsNameNotFound,
    SrvUnavailable,
    ExtendedOutage,
}

impl DisableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisableReason::DnsNameNotFound => "DNS name does not exist",
            DisableReason::SrvUnavailable => "Query port not defined and SRV lookup is unavailable",
            DisableReason::ExtendedOutage => "Offline for extended period of time",
        }
    }

    /// 即座に無効化すべき失敗なら、その理由を返す。
    pub fn for_failure(failure: &QueryFailure) -> Option<Self> {
        match failure {
            QueryFailure::NameNotFound => Some(DisableReason::DnsNameNotFound),
            QueryFailure::SrvUnsupported(_) => Some(DisableReason::SrvUnavailable),
            _ => None,
        }
    }
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRef {
    pub id: StatusId,
    pub guild_id: u64,
    pub label: String,
    pub display_name: String,
    pub address: Option<String>,
}

impl From<&Status> for StatusRef {
    fn from(status: &Status) -> Self {
        Self {
            id: status.id,
            guild_id: status.guild_id,
            label: status.label.clone(),
            display_name: status.display_name().to_string(),
            address: status.address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRef {
    pub id: QueryId,
    pub kind: ProtocolKind,
    pub address: String,
}

impl From<&Query> for QueryRef {
    fn from(query: &Query) -> Self {
        Self {
            id: query.id,
            kind: query.kind,
            address: query.address(),
        }
    }
}

/// アラートの送り先の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertChannel {
    Downtime,
    Audit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    WentOffline {
        status: StatusRef,
    },
    BackOnline {
        status: StatusRef,
    },
    QueryDisabled {
        status: StatusRef,
        query: QueryRef,
        reason: DisableReason,
    },
}

impl AlertEvent {
    pub fn status(&self) -> &StatusRef {
        match self {
            AlertEvent::WentOffline { status }
            | AlertEvent::BackOnline { status }
            | AlertEvent::QueryDisabled { status, .. } => status,
        }
    }

    pub fn channel(&self) -> AlertChannel {
        match self {
            AlertEvent::WentOffline { .. } | AlertEvent::BackOnline { .. } => {
                AlertChannel::Downtime
            }
            AlertEvent::QueryDisabled { .. } => AlertChannel::Audit,
        }
    }

    pub fn title(&self) -> String {
        match self {
            AlertEvent::WentOffline { status } => format!("{} offline", status.label),
            AlertEvent::BackOnline { status } => format!("{} online", status.label),
            AlertEvent::QueryDisabled { status, .. } => format!("Query for {} failed", status.label),
        }
    }

    pub fn description(&self) -> String {
        let address = |status: &StatusRef| status.address.clone().unwrap_or_else(|| "-".into());
        match self {
            AlertEvent::WentOffline { status } => format!(
                "{} has stopped responding to queries.\n**Address:** {}",
                status.display_name,
                address(status)
            ),
            AlertEvent::BackOnline { status } => format!(
                "{} is responding to queries again.\n**Address:** {}",
                status.display_name,
                address(status)
            ),
            AlertEvent::QueryDisabled { query, reason, .. } => format!(
                "The {} query on {} has been disabled due to the following reason:\n```{}```",
                query.kind.label(),
                query.address,
                reason
            ),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()>;
}

/// アラートをログに書き出す。
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()> {
        let status = event.status();
        match event {
            AlertEvent::WentOffline { .. } => {
                warn!(status_id = %status.id, label = %status.label, "Status went offline")
            }
            AlertEvent::BackOnline { .. } => {
                info!(status_id = %status.id, label = %status.label, "Status back online")
            }
            AlertEvent::QueryDisabled { query, reason, .. } => warn!(
                status_id = %status.id,
                query_id = %query.id,
                kind = %query.kind,
                address = %query.address,
                %reason,
                "Query disabled"
            ),
        }
        Ok(())
    }
}

/// アラートを全ての送り先に順に配送する。1 つが失敗しても他は止めない。
#[derive(Clone, Default)]
pub struct AlertDispatcher {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn dispatch(&self, events: &[AlertEvent]) {
        for event in events {
            for sink in &self.sinks {
                if let Err(e) = sink.deliver(event).await {
                    error!(
                        sink = sink.name(),
                        status_id = %event.status().id,
                        error = %e,
                        "Failed to deliver alert"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, query, status};

    struct BrokenSink;

    #[async_trait]
    impl AlertSink for BrokenSink {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn deliver(&self, _event: &AlertEvent) -> anyhow::Result<()> {
            anyhow::bail!("channel missing")
        }
    }

    fn disabled(reason: DisableReason) -> AlertEvent {
        let mut q = query(7, 1, ProtocolKind::MinecraftJava, 0);
        q.host = "mc.example.com".to_string();
        AlertEvent::QueryDisabled {
            status: StatusRef::from(&status(1)),
            query: QueryRef::from(&q),
            reason,
        }
    }

    #[test]
    fn reason_codes_are_fixed_strings() {
        assert_eq!(
            DisableReason::for_failure(&QueryFailure::NameNotFound).map(DisableReason::as_str),
            Some("DNS name does not exist")
        );
        assert_eq!(
            DisableReason::for_failure(&QueryFailure::SrvUnsupported(ProtocolKind::Source)),
            Some(DisableReason::SrvUnavailable)
        );
        assert_eq!(DisableReason::for_failure(&QueryFailure::Timeout), None);
        assert_eq!(
            DisableReason::ExtendedOutage.to_string(),
            "Offline for extended period of time"
        );
    }

    #[test]
    fn audit_alerts_name_the_query() {
        let event = disabled(DisableReason::DnsNameNotFound);
        assert_eq!(event.channel(), AlertChannel::Audit);
        assert_eq!(event.title(), "Query for status-1 failed");
        assert!(event.description().contains("Minecraft: Java Edition"));
        assert!(event.description().contains("mc.example.com:25572"));
        assert!(event.description().contains("DNS name does not exist"));
    }

    #[test]
    fn downtime_alerts_use_display_name() {
        let mut s = status(1);
        s.title = Some("Survival".to_string());
        s.address = Some("play.example.com".to_string());
        let event = AlertEvent::WentOffline {
            status: StatusRef::from(&s),
        };

        assert_eq!(event.channel(), AlertChannel::Downtime);
        assert_eq!(event.title(), "status-1 offline");
        assert_eq!(
            event.description(),
            "Survival has stopped responding to queries.\n**Address:** play.example.com"
        );
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others() {
        let recorder = Arc::new(RecordingSink::default());
        let dispatcher = AlertDispatcher::new()
            .with_sink(Arc::new(BrokenSink))
            .with_sink(Arc::new(LogSink))
            .with_sink(recorder.clone());

        let events = vec![
            disabled(DisableReason::DnsNameNotFound),
            disabled(DisableReason::ExtendedOutage),
        ];
        dispatcher.dispatch(&events).await;

        assert_eq!(recorder.events(), events);
    }
}
