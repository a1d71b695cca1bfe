//! 1 ステータス分のポーリング。優先度順のフェイルオーバー、
//! 失敗の記録、ダウン判定を行う。

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::alert::{AlertEvent, DisableReason, QueryRef, StatusRef};
use crate::autodisable::{AutoDisablePolicy, FailureVerdict};
use crate::downtime::{DowntimeWindow, Transition};
use crate::error::{FailureClass, QueryFailure};
use crate::model::{HistoryPoint, Query, QueryId, Status, StatusEntry, StatusId};
use crate::protocol::Reply;
use crate::runner::QueryRunner;

/// 1 回のポーリングで発生するクエリ行への書き込み。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryChange {
    /// 連続失敗中でなければ `failed_at` をセットする
    Failed {
        query: QueryId,
        since: DateTime<Utc>,
    },
    /// `failed_at` をクリアする
    Recovered { query: QueryId },
    /// `enabled_at` をクリアし、`failed_at` を記録する
    Disabled {
        query: QueryId,
        at: DateTime<Utc>,
        reason: DisableReason,
    },
}

/// ステータスに書き込む表示用の項目。`None` の項目は保存済みの値を残す。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheUpdate {
    pub title: Option<String>,
    pub address: Option<String>,
    pub thumbnail: Option<Vec<u8>>,
    pub game: Option<String>,
    pub map: Option<String>,
    pub version: Option<String>,
}

impl CacheUpdate {
    fn from_reply(reply: &Reply) -> Option<Self> {
        let update = Self {
            title: reply.title.clone(),
            address: reply.address.clone(),
            thumbnail: reply.thumbnail.clone(),
            game: reply.game.clone(),
            map: reply.map.clone(),
            version: reply.version.clone(),
        };
        (update != Self::default()).then_some(update)
    }
}

/// ポーリング結果。表示側に渡す。
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub status_id: StatusId,
    pub guild_id: u64,
    pub label: String,
    pub online: bool,
    pub down: bool,
    /// 失敗中だが、まだダウンとはみなさない状態
    pub intermediary: bool,
    /// 応答したクエリ
    pub query_id: Option<QueryId>,
    pub title: Option<String>,
    pub address: Option<String>,
    pub game: Option<String>,
    pub map: Option<String>,
    pub version: Option<String>,
    pub max_players: Option<u32>,
    pub num_players: Option<u32>,
    pub players: Vec<String>,
    /// どれも応答しなかった場合、最後に試したクエリの失敗
    pub failure: Option<QueryFailure>,
}

/// 1 回のポーリングで保存・通知するもの一式。
#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    pub point: HistoryPoint,
    pub query_changes: Vec<QueryChange>,
    pub cache: Option<CacheUpdate>,
    /// 配送する順
    pub alerts: Vec<AlertEvent>,
}

impl PollReport {
    pub fn status_id(&self) -> StatusId {
        self.outcome.status_id
    }
}

#[derive(Clone)]
pub struct StatusPoller {
    runner: QueryRunner,
    policy: AutoDisablePolicy,
}

impl StatusPoller {
    pub fn new(runner: QueryRunner, policy: AutoDisablePolicy) -> Self {
        Self { runner, policy }
    }

    /// 直近の履歴 (新しい順) を元に `entry` をポーリングする。
    ///
    /// 有効なクエリが 1 つも無ければ `None` を返す。
    pub async fn poll(
        &self,
        entry: &StatusEntry,
        history: &[HistoryPoint],
        now: DateTime<Utc>,
    ) -> Option<PollReport> {
        let status = &entry.status;
        let mut queries: Vec<&Query> = entry
            .queries
            .iter()
            .filter(|q| q.is_enabled() && q.status_id == status.id)
            .collect();
        if queries.is_empty() {
            debug!(status_id = %status.id, "No enabled queries");
            return None;
        }
        queries.sort_by_key(|q| (q.priority, q.id));

        let mut changes = Vec::new();
        let mut alerts = Vec::new();
        let mut answer: Option<(&Query, Reply)> = None;
        let mut last_failure = None;

        for query in queries {
            match self.runner.attempt(query).await {
                Ok(reply) => {
                    if query.failed_at.is_some() {
                        changes.push(QueryChange::Recovered { query: query.id });
                    }
                    answer = Some((query, reply));
                    break;
                }
                Err(failure) => {
                    debug!(
                        status_id = %status.id,
                        query_id = %query.id,
                        kind = %query.kind,
                        error = %failure,
                        "Query failed"
                    );
                    if let Some((change, alert)) = self.on_failure(status, query, &failure, now) {
                        changes.push(change);
                        alerts.extend(alert);
                    }
                    last_failure = Some(failure);
                }
            }
        }

        let online = answer.is_some();
        let verdict = DowntimeWindow::from_history(history).observe(online);
        match verdict.transition {
            Some(Transition::WentOffline) => alerts.push(AlertEvent::WentOffline {
                status: StatusRef::from(status),
            }),
            Some(Transition::BackOnline) => alerts.push(AlertEvent::BackOnline {
                status: StatusRef::from(status),
            }),
            None => {}
        }

        let (query_id, reply) = match answer {
            Some((query, reply)) => (Some(query.id), reply),
            None => (None, Reply::default()),
        };

        let cache = CacheUpdate::from_reply(&reply);

        let point = HistoryPoint {
            created_at: now,
            online,
            down: verdict.down,
            max_players: reply.max_players,
            num_players: reply.num_players,
            players: reply.players.clone(),
        };

        let outcome = PollOutcome {
            status_id: status.id,
            guild_id: status.guild_id,
            label: status.label.clone(),
            online,
            down: verdict.down,
            intermediary: !online && !verdict.down,
            query_id,
            title: reply.title.or_else(|| status.title.clone()),
            address: reply.address.or_else(|| status.address.clone()),
            game: reply.game.or_else(|| status.game.clone()),
            map: reply.map.or_else(|| status.map.clone()),
            version: reply.version.or_else(|| status.version.clone()),
            max_players: reply.max_players,
            num_players: reply.num_players,
            players: reply.players,
            failure: if online { None } else { last_failure },
        };

        Some(PollReport {
            outcome,
            point,
            query_changes: changes,
            cache,
            alerts,
        })
    }

    fn on_failure(
        &self,
        status: &Status,
        query: &Query,
        failure: &QueryFailure,
        now: DateTime<Utc>,
    ) -> Option<(QueryChange, Option<AlertEvent>)> {
        let reason = match failure.class() {
            FailureClass::Configuration => DisableReason::for_failure(failure)?,
            FailureClass::Transient => match self.policy.on_failure(query.failed_at, now) {
                FailureVerdict::Failing { since } => {
                    return Some((
                        QueryChange::Failed {
                            query: query.id,
                            since,
                        },
                        None,
                    ));
                }
                FailureVerdict::Expired { .. } => DisableReason::ExtendedOutage,
            },
        };

        warn!(
            status_id = %status.id,
            query_id = %query.id,
            %reason,
            "Disabling query"
        );
        let alert = AlertEvent::QueryDisabled {
            status: StatusRef::from(status),
            query: QueryRef::from(query),
            reason,
        };
        Some((
            QueryChange::Disabled {
                query: query.id,
                at: now,
                reason,
            },
            Some(alert),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::model::ProtocolKind;
    use crate::protocol::ProtocolTable;
    use crate::resolver::Resolver;
    use crate::store::{MemoryStore, StatusStore};
    use crate::testing::{FakeDns, ScriptedProtocol, online, query, status, t};

    fn poller(dns: FakeDns, table: ProtocolTable) -> StatusPoller {
        let runner = QueryRunner::new(Resolver::new(Arc::new(dns)), table, Duration::from_secs(3));
        StatusPoller::new(runner, AutoDisablePolicy::default())
    }

    fn entry(queries: Vec<Query>) -> StatusEntry {
        StatusEntry {
            status: status(1),
            queries,
        }
    }

    fn offline_point(minute: i64, down: bool) -> HistoryPoint {
        HistoryPoint {
            created_at: t(minute),
            online: false,
            down,
            max_players: None,
            num_players: None,
            players: Vec::new(),
        }
    }

    fn online_point(minute: i64) -> HistoryPoint {
        HistoryPoint {
            online: true,
            ..offline_point(minute, false)
        }
    }

    #[tokio::test]
    async fn fails_over_to_next_priority() {
        let five = Reply {
            title: Some("Survival".to_string()),
            max_players: Some(5),
            num_players: Some(5),
            players: ["a", "b", "c", "d", "e"].map(String::from).to_vec(),
            ..Reply::default()
        };
        let a2s = Arc::new(ScriptedProtocol::always(Err(QueryFailure::Timeout)));
        let java = Arc::new(ScriptedProtocol::always(Ok(five)));
        let bedrock = Arc::new(ScriptedProtocol::always(online(&[])));
        let mut table = ProtocolTable::default();
        table
            .register(ProtocolKind::Source, a2s.clone())
            .register(ProtocolKind::MinecraftJava, java.clone())
            .register(ProtocolKind::MinecraftBedrock, bedrock.clone());

        let mut minecraft = query(2, 1, ProtocolKind::MinecraftJava, 1);
        minecraft.failed_at = Some(t(-30));
        let entry = entry(vec![
            query(3, 1, ProtocolKind::MinecraftBedrock, 2),
            minecraft,
            query(1, 1, ProtocolKind::Source, 0),
        ]);

        let report = poller(FakeDns::default(), table)
            .poll(&entry, &[], t(0))
            .await
            .unwrap();

        assert!(report.point.online);
        assert_eq!(report.point.max_players, Some(5));
        assert_eq!(report.point.players.len(), 5);
        assert_eq!(report.outcome.query_id, Some(QueryId(2)));
        assert_eq!(
            report.query_changes,
            vec![
                QueryChange::Failed {
                    query: QueryId(1),
                    since: t(0)
                },
                QueryChange::Recovered { query: QueryId(2) },
            ]
        );
        assert_eq!(a2s.calls(), 1);
        assert_eq!(java.calls(), 1);
        assert_eq!(bedrock.calls(), 0);
        assert_eq!(report.cache.unwrap().title.as_deref(), Some("Survival"));
        assert!(report.alerts.is_empty());
    }

    #[tokio::test]
    async fn missing_dns_name_disables_with_one_audit_alert() {
        let java = Arc::new(ScriptedProtocol::always(online(&[])));
        let mut table = ProtocolTable::default();
        table.register(ProtocolKind::MinecraftJava, java.clone());
        let mut q = query(1, 1, ProtocolKind::MinecraftJava, 0);
        q.host = "gone.example.com".to_string();

        let report = poller(FakeDns::default(), table)
            .poll(&entry(vec![q]), &[online_point(-1)], t(0))
            .await
            .unwrap();

        assert!(!report.point.online);
        assert!(report.outcome.intermediary);
        assert_eq!(report.outcome.failure, Some(QueryFailure::NameNotFound));
        assert_eq!(
            report.query_changes,
            vec![QueryChange::Disabled {
                query: QueryId(1),
                at: t(0),
                reason: DisableReason::DnsNameNotFound
            }]
        );
        assert_eq!(report.alerts.len(), 1);
        assert!(matches!(
            &report.alerts[0],
            AlertEvent::QueryDisabled { reason: DisableReason::DnsNameNotFound, .. }
        ));
        assert_eq!(java.calls(), 0);
    }

    #[tokio::test]
    async fn disabled_queries_are_skipped() {
        let java = Arc::new(ScriptedProtocol::always(online(&[])));
        let mut table = ProtocolTable::default();
        table.register(ProtocolKind::MinecraftJava, java.clone());
        let mut q = query(1, 1, ProtocolKind::MinecraftJava, 0);
        q.enabled_at = None;

        let report = poller(FakeDns::default(), table)
            .poll(&entry(vec![q]), &[], t(0))
            .await;

        assert!(report.is_none());
        assert_eq!(java.calls(), 0);
    }

    #[tokio::test]
    async fn third_failure_goes_down() {
        let mut table = ProtocolTable::default();
        table.register(
            ProtocolKind::Source,
            Arc::new(ScriptedProtocol::always(Err(QueryFailure::Timeout))),
        );
        let entry = entry(vec![query(1, 1, ProtocolKind::Source, 0)]);
        let history = [offline_point(-1, false), offline_point(-2, false)];

        let report = poller(FakeDns::default(), table)
            .poll(&entry, &history, t(0))
            .await
            .unwrap();

        assert!(report.point.down);
        assert!(!report.outcome.intermediary);
        assert_eq!(
            report.alerts,
            vec![AlertEvent::WentOffline {
                status: StatusRef::from(&entry.status)
            }]
        );
    }

    #[tokio::test]
    async fn fresh_status_goes_down_on_first_failure() {
        let mut table = ProtocolTable::default();
        table.register(
            ProtocolKind::Source,
            Arc::new(ScriptedProtocol::always(Err(QueryFailure::Timeout))),
        );
        let entry = entry(vec![query(1, 1, ProtocolKind::Source, 0)]);

        let report = poller(FakeDns::default(), table)
            .poll(&entry, &[], t(0))
            .await
            .unwrap();

        assert!(report.point.down);
        assert!(!report.outcome.intermediary);
        assert!(matches!(report.alerts.as_slice(), [AlertEvent::WentOffline { .. }]));
    }

    #[tokio::test]
    async fn server_details_reach_cache_and_outcome() {
        let reply = Reply {
            title: Some("Altis Life".to_string()),
            game: Some("Arma 3".to_string()),
            version: Some("2.18".to_string()),
            ..Reply::default()
        };
        let mut table = ProtocolTable::default();
        table.register(ProtocolKind::Arma3, Arc::new(ScriptedProtocol::always(Ok(reply))));
        let mut entry = entry(vec![query(1, 1, ProtocolKind::Arma3, 0)]);
        entry.status.map = Some("Altis".to_string());

        let report = poller(FakeDns::default(), table)
            .poll(&entry, &[], t(0))
            .await
            .unwrap();

        let cache = report.cache.unwrap();
        assert_eq!(cache.game.as_deref(), Some("Arma 3"));
        assert_eq!(cache.version.as_deref(), Some("2.18"));
        assert_eq!(cache.map, None);
        assert_eq!(report.outcome.game.as_deref(), Some("Arma 3"));
        assert_eq!(report.outcome.map.as_deref(), Some("Altis"));
    }

    #[tokio::test]
    async fn success_after_downtime_announces_recovery() {
        let mut table = ProtocolTable::default();
        table.register(ProtocolKind::Source, Arc::new(ScriptedProtocol::always(online(&["x"]))));
        let entry = entry(vec![query(1, 1, ProtocolKind::Source, 0)]);
        let history = [offline_point(-1, true), offline_point(-2, true)];

        let report = poller(FakeDns::default(), table)
            .poll(&entry, &history, t(0))
            .await
            .unwrap();

        assert!(!report.point.down);
        assert!(matches!(report.alerts.as_slice(), [AlertEvent::BackOnline { .. }]));
    }

    #[tokio::test]
    async fn day_long_failure_disables_query() {
        let mut table = ProtocolTable::default();
        table.register(
            ProtocolKind::Source,
            Arc::new(ScriptedProtocol::always(Err(QueryFailure::unreachable("refused")))),
        );
        let mut q = query(1, 1, ProtocolKind::Source, 0);
        q.failed_at = Some(t(0));
        let now = t(24 * 60);

        let report = poller(FakeDns::default(), table)
            .poll(&entry(vec![q]), &[online_point(-1)], now)
            .await
            .unwrap();

        assert_eq!(
            report.query_changes,
            vec![QueryChange::Disabled {
                query: QueryId(1),
                at: now,
                reason: DisableReason::ExtendedOutage
            }]
        );
        assert!(matches!(
            report.alerts.as_slice(),
            [AlertEvent::QueryDisabled { reason: DisableReason::ExtendedOutage, .. }]
        ));
    }

    #[tokio::test]
    async fn success_resets_the_failure_clock() {
        let flaky = ScriptedProtocol::always(Err(QueryFailure::Timeout)).then(online(&[]));
        let mut table = ProtocolTable::default();
        table.register(ProtocolKind::Source, Arc::new(flaky));
        let poller = poller(FakeDns::default(), table);

        let store = MemoryStore::new();
        store.insert_status(status(1)).unwrap();
        let mut q = query(1, 1, ProtocolKind::Source, 0);
        q.failed_at = Some(t(0));
        store.insert_query(q).unwrap();

        for now in [t(23 * 60), t(25 * 60)] {
            let entries = store.enabled_statuses().await.unwrap();
            let report = poller.poll(&entries[0], &[], now).await.unwrap();
            store.record_poll(&report).await.unwrap();
        }

        let q = store.query(QueryId(1)).unwrap();
        assert!(q.is_enabled());
        assert_eq!(q.failed_at, Some(t(25 * 60)));
    }
}
