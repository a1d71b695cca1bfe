use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Retention, StatusStore, StoreError};
use crate::model::{HistoryPoint, Query, QueryId, Status, StatusEntry, StatusId};
use crate::poller::{PollReport, QueryChange};

#[derive(Default)]
struct Inner {
    statuses: BTreeMap<StatusId, Status>,
    queries: BTreeMap<QueryId, Query>,
    /// 古い順
    history: HashMap<StatusId, Vec<HistoryPoint>>,
}

/// メモリ上だけで完結するストア。テストや組み込み用。
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_status(&self, status: Status) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let taken = inner.statuses.values().any(|s| {
            s.id != status.id && s.guild_id == status.guild_id && s.label == status.label
        });
        if taken {
            return Err(StoreError::DuplicateLabel {
                guild_id: status.guild_id,
                label: status.label,
            });
        }
        inner.statuses.insert(status.id, status);
        Ok(())
    }

    pub fn insert_query(&self, query: Query) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.statuses.contains_key(&query.status_id) {
            return Err(StoreError::UnknownStatus(query.status_id));
        }
        let taken = inner.queries.values().any(|q| {
            q.id != query.id
                && q.status_id == query.status_id
                && q.host == query.host
                && q.port == query.port
        });
        if taken {
            return Err(StoreError::DuplicateQuery {
                status: query.status_id,
                address: query.address(),
            });
        }
        inner.queries.insert(query.id, query);
        Ok(())
    }

    /// ステータスをクエリ・履歴ごと削除する。
    pub fn remove_status(&self, id: StatusId) -> Option<Status> {
        let mut inner = self.lock();
        inner.queries.retain(|_, q| q.status_id != id);
        inner.history.remove(&id);
        inner.statuses.remove(&id)
    }

    pub fn status(&self, id: StatusId) -> Option<Status> {
        self.lock().statuses.get(&id).cloned()
    }

    pub fn query(&self, id: QueryId) -> Option<Query> {
        self.lock().queries.get(&id).cloned()
    }

    /// `status` の全履歴を古い順で返す。
    pub fn history(&self, status: StatusId) -> Vec<HistoryPoint> {
        self.lock().history.get(&status).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn enabled_statuses(&self) -> Result<Vec<StatusEntry>, StoreError> {
        let inner = self.lock();
        let entries = inner
            .statuses
            .values()
            .filter(|s| s.is_enabled())
            .map(|status| {
                let mut queries: Vec<Query> = inner
                    .queries
                    .values()
                    .filter(|q| q.status_id == status.id && q.is_enabled())
                    .cloned()
                    .collect();
                queries.sort_by_key(|q| (q.priority, q.id));
                StatusEntry {
                    status: status.clone(),
                    queries,
                }
            })
            .collect();
        Ok(entries)
    }

    async fn recent_history(
        &self,
        status: StatusId,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        let inner = self.lock();
        let points = inner.history.get(&status).map(Vec::as_slice).unwrap_or_default();
        Ok(points.iter().rev().take(limit).cloned().collect())
    }

    async fn record_poll(&self, report: &PollReport) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let status_id = report.status_id();
        if !inner.statuses.contains_key(&status_id) {
            return Err(StoreError::UnknownStatus(status_id));
        }
        if let Some(last) = inner.history.get(&status_id).and_then(|h| h.last())
            && last.created_at >= report.point.created_at
        {
            return Err(StoreError::HistoryOutOfOrder {
                status: status_id,
                last: last.created_at,
                attempted: report.point.created_at,
            });
        }
        for change in &report.query_changes {
            let id = match change {
                QueryChange::Failed { query, .. }
                | QueryChange::Recovered { query }
                | QueryChange::Disabled { query, .. } => *query,
            };
            if !inner.queries.contains_key(&id) {
                return Err(StoreError::UnknownQuery(id));
            }
        }

        // 検証済みなので、ここから先は失敗しない
        for change in &report.query_changes {
            match change {
                QueryChange::Failed { query, since } => {
                    if let Some(q) = inner.queries.get_mut(query) {
                        q.failed_at.get_or_insert(*since);
                    }
                }
                QueryChange::Recovered { query } => {
                    if let Some(q) = inner.queries.get_mut(query) {
                        q.failed_at = None;
                    }
                }
                QueryChange::Disabled { query, at, .. } => {
                    if let Some(q) = inner.queries.get_mut(query) {
                        q.enabled_at = None;
                        q.failed_at = Some(*at);
                    }
                }
            }
        }
        if let (Some(cache), Some(status)) = (&report.cache, inner.statuses.get_mut(&status_id)) {
            coalesce(&mut status.title, &cache.title);
            coalesce(&mut status.address, &cache.address);
            coalesce(&mut status.thumbnail, &cache.thumbnail);
            coalesce(&mut status.game, &cache.game);
            coalesce(&mut status.map, &cache.map);
            coalesce(&mut status.version, &cache.version);
        }
        inner
            .history
            .entry(status_id)
            .or_default()
            .push(report.point.clone());
        Ok(())
    }

    async fn prune_history(
        &self,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<u64, StoreError> {
        let history_cutoff = now - retention.history;
        let players_cutoff = now - retention.players;
        let mut removed = 0;
        for points in self.lock().history.values_mut() {
            let before = points.len();
            points.retain(|p| p.created_at >= history_cutoff);
            removed += (before - points.len()) as u64;
            for point in points.iter_mut().filter(|p| p.created_at < players_cutoff) {
                point.players.clear();
            }
        }
        Ok(removed)
    }
}

/// `value` がある場合だけ `slot` を上書きする。
fn coalesce<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::model::ProtocolKind;
    use crate::poller::CacheUpdate;
    use crate::testing::{query, report, status, t};

    fn point(minute: i64, online: bool, players: &[&str]) -> HistoryPoint {
        HistoryPoint {
            created_at: t(minute),
            online,
            down: false,
            max_players: None,
            num_players: Some(players.len() as u32),
            players: players.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_status(status(1)).unwrap();
        store.insert_query(query(1, 1, ProtocolKind::Source, 1)).unwrap();
        store.insert_query(query(2, 1, ProtocolKind::MinecraftJava, 0)).unwrap();
        store
    }

    #[tokio::test]
    async fn enabled_statuses_orders_queries_by_priority() {
        let store = seeded();
        let mut disabled = status(2);
        disabled.enabled_at = None;
        store.insert_status(disabled).unwrap();
        let mut off = query(3, 1, ProtocolKind::Fivem, 0);
        off.enabled_at = None;
        store.insert_query(off).unwrap();

        let entries = store.enabled_statuses().await.unwrap();

        assert_eq!(entries.len(), 1);
        let ids: Vec<_> = entries[0].queries.iter().map(|q| q.id).collect();
        assert_eq!(ids, vec![QueryId(2), QueryId(1)]);
    }

    #[test]
    fn labels_are_unique_per_guild() {
        let store = seeded();
        let mut clash = status(9);
        clash.label = "status-1".to_string();
        assert!(matches!(
            store.insert_status(clash.clone()),
            Err(StoreError::DuplicateLabel { .. })
        ));

        clash.guild_id = 2000;
        store.insert_status(clash).unwrap();
    }

    #[test]
    fn query_addresses_are_unique_per_status() {
        let store = seeded();
        let mut clash = query(5, 1, ProtocolKind::Fivem, 3);
        clash.port = 25566;
        assert!(matches!(
            store.insert_query(clash),
            Err(StoreError::DuplicateQuery { .. })
        ));
        assert!(matches!(
            store.insert_query(query(6, 42, ProtocolKind::Fivem, 0)),
            Err(StoreError::UnknownStatus(StatusId(42)))
        ));
    }

    #[tokio::test]
    async fn record_poll_applies_changes_and_cache() {
        let store = seeded();
        let mut report = report(1, point(0, true, &["alice"]));
        report.query_changes = vec![
            QueryChange::Failed {
                query: QueryId(2),
                since: t(0),
            },
            QueryChange::Disabled {
                query: QueryId(1),
                at: t(0),
                reason: crate::alert::DisableReason::DnsNameNotFound,
            },
        ];
        report.cache = Some(CacheUpdate {
            title: Some("Survival".to_string()),
            ..CacheUpdate::default()
        });

        store.record_poll(&report).await.unwrap();

        assert_eq!(store.query(QueryId(2)).unwrap().failed_at, Some(t(0)));
        assert!(!store.query(QueryId(1)).unwrap().is_enabled());
        let status = store.status(StatusId(1)).unwrap();
        assert_eq!(status.title.as_deref(), Some("Survival"));
        assert_eq!(store.history(StatusId(1)).len(), 1);
    }

    #[tokio::test]
    async fn cache_keeps_fields_the_reply_left_out() {
        let store = seeded();
        let mut first = report(1, point(0, true, &[]));
        first.cache = Some(CacheUpdate {
            title: Some("Altis Life".to_string()),
            game: Some("Arma 3".to_string()),
            map: Some("Altis".to_string()),
            version: Some("2.18".to_string()),
            ..CacheUpdate::default()
        });
        store.record_poll(&first).await.unwrap();

        let mut second = report(1, point(1, true, &[]));
        second.cache = Some(CacheUpdate {
            map: Some("Stratis".to_string()),
            ..CacheUpdate::default()
        });
        store.record_poll(&second).await.unwrap();

        let status = store.status(StatusId(1)).unwrap();
        assert_eq!(status.title.as_deref(), Some("Altis Life"));
        assert_eq!(status.game.as_deref(), Some("Arma 3"));
        assert_eq!(status.map.as_deref(), Some("Stratis"));
        assert_eq!(status.version.as_deref(), Some("2.18"));
    }

    #[tokio::test]
    async fn failed_keeps_first_timestamp() {
        let store = seeded();
        for minute in [0, 1] {
            let mut report = report(1, point(minute, false, &[]));
            report.query_changes = vec![QueryChange::Failed {
                query: QueryId(1),
                since: t(minute),
            }];
            store.record_poll(&report).await.unwrap();
        }
        assert_eq!(store.query(QueryId(1)).unwrap().failed_at, Some(t(0)));

        let mut report = report(1, point(2, true, &[]));
        report.query_changes = vec![QueryChange::Recovered { query: QueryId(1) }];
        store.record_poll(&report).await.unwrap();
        assert_eq!(store.query(QueryId(1)).unwrap().failed_at, None);
    }

    #[tokio::test]
    async fn history_must_move_forward() {
        let store = seeded();
        store.record_poll(&report(1, point(5, true, &[]))).await.unwrap();

        for minute in [5, 4] {
            let err = store.record_poll(&report(1, point(minute, true, &[]))).await.unwrap_err();
            assert!(matches!(err, StoreError::HistoryOutOfOrder { .. }));
        }
        assert_eq!(store.history(StatusId(1)).len(), 1);
    }

    #[tokio::test]
    async fn recent_history_is_newest_first() {
        let store = seeded();
        for minute in 0..4 {
            store.record_poll(&report(1, point(minute, minute % 2 == 0, &[]))).await.unwrap();
        }

        let recent = store.recent_history(StatusId(1), 2).await.unwrap();
        let times: Vec<_> = recent.iter().map(|p| p.created_at).collect();
        assert_eq!(times, vec![t(3), t(2)]);
        assert!(store.recent_history(StatusId(7), 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_drops_old_points_and_player_names() {
        let store = seeded();
        for minute in [0, 50, 100] {
            store.record_poll(&report(1, point(minute, true, &["alice"]))).await.unwrap();
        }
        let retention = Retention {
            history: TimeDelta::minutes(90),
            players: TimeDelta::minutes(30),
        };

        let removed = store.prune_history(t(120), &retention).await.unwrap();

        assert_eq!(removed, 1);
        let history = store.history(StatusId(1));
        assert_eq!(history.len(), 2);
        assert!(history[0].players.is_empty());
        assert_eq!(history[1].players, vec!["alice"]);
    }

    #[test]
    fn removing_a_status_cascades() {
        let store = seeded();
        assert!(store.remove_status(StatusId(1)).is_some());
        assert!(store.query(QueryId(1)).is_none());
        assert!(store.history(StatusId(1)).is_empty());
    }
}
