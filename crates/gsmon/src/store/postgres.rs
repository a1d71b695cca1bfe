use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::info;

use super::{Retention, StatusStore, StoreError};
use crate::model::{HistoryPoint, ProtocolKind, Query, QueryId, Status, StatusEntry, StatusId};
use crate::poller::{PollReport, QueryChange};

/// PostgreSQL を使う [`StatusStore`]。
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// 接続し、未適用のマイグレーションを実行する。
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready");
        Ok(Self { pool })
    }
}

fn decode_status(row: &PgRow) -> Result<Status, sqlx::Error> {
    Ok(Status {
        id: StatusId(row.try_get("status_id")?),
        guild_id: row.try_get::<i64, _>("guild_id")? as u64,
        label: row.try_get("label")?,
        enabled_at: row.try_get("enabled_at")?,
        title: row.try_get("title")?,
        address: row.try_get("address")?,
        thumbnail: row.try_get("thumbnail")?,
        game: row.try_get("game")?,
        map: row.try_get("map")?,
        version: row.try_get("version")?,
    })
}

fn decode_query(row: &PgRow) -> Result<Query, sqlx::Error> {
    let kind: String = row.try_get("type")?;
    let port: i32 = row.try_get("port")?;
    let priority: i32 = row.try_get("priority")?;
    Ok(Query {
        id: QueryId(row.try_get("status_query_id")?),
        status_id: StatusId(row.try_get("status_id")?),
        host: row.try_get("host")?,
        port: u16::try_from(port).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        kind: kind
            .parse::<ProtocolKind>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        priority: u32::try_from(priority).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        enabled_at: row.try_get("enabled_at")?,
        failed_at: row.try_get("failed_at")?,
        extra: row.try_get("extra")?,
    })
}

fn decode_point(row: &PgRow) -> Result<HistoryPoint, sqlx::Error> {
    let count = |column: &str| -> Result<Option<u32>, sqlx::Error> {
        let value: Option<i32> = row.try_get(column)?;
        Ok(value.map(|n| n.max(0) as u32))
    };
    Ok(HistoryPoint {
        created_at: row.try_get("created_at")?,
        online: row.try_get("online")?,
        down: row.try_get("down")?,
        max_players: count("max_players")?,
        num_players: count("num_players")?,
        players: row.try_get("players")?,
    })
}

fn encode_count(count: Option<u32>) -> Option<i32> {
    count.map(|n| i32::try_from(n).unwrap_or(i32::MAX))
}

#[async_trait]
impl StatusStore for PgStore {
    async fn enabled_statuses(&self) -> Result<Vec<StatusEntry>, StoreError> {
        let statuses = sqlx::query(
            "SELECT status_id, guild_id, label, enabled_at, title, address, thumbnail, \
                    game, map, version \
             FROM status WHERE enabled_at IS NOT NULL ORDER BY status_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let queries = sqlx::query(
            "SELECT q.status_query_id, q.status_id, q.host, q.port, q.type, q.priority, \
                    q.enabled_at, q.failed_at, q.extra \
             FROM status_query q JOIN status s USING (status_id) \
             WHERE q.enabled_at IS NOT NULL AND s.enabled_at IS NOT NULL \
             ORDER BY q.status_id, q.priority, q.status_query_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_status: HashMap<StatusId, Vec<Query>> = HashMap::new();
        for row in &queries {
            let query = decode_query(row)?;
            by_status.entry(query.status_id).or_default().push(query);
        }

        statuses
            .iter()
            .map(|row| -> Result<StatusEntry, StoreError> {
                let status = decode_status(row)?;
                let queries = by_status.remove(&status.id).unwrap_or_default();
                Ok(StatusEntry { status, queries })
            })
            .collect()
    }

    async fn recent_history(
        &self,
        status: StatusId,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT created_at, online, down, max_players, num_players, players \
             FROM status_history WHERE status_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(status.0)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(decode_point).collect::<Result<_, _>>()?)
    }

    async fn record_poll(&self, report: &PollReport) -> Result<(), StoreError> {
        let status_id = report.status_id();
        let point = &report.point;
        let mut tx = self.pool.begin().await?;

        // 同じステータスへの書き込みを直列化する
        let locked = sqlx::query("SELECT status_id FROM status WHERE status_id = $1 FOR UPDATE")
            .bind(status_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::UnknownStatus(status_id));
        }

        let last: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT max(created_at) FROM status_history WHERE status_id = $1")
                .bind(status_id.0)
                .fetch_one(&mut *tx)
                .await?;
        if let Some(last) = last
            && last >= point.created_at
        {
            return Err(StoreError::HistoryOutOfOrder {
                status: status_id,
                last,
                attempted: point.created_at,
            });
        }

        sqlx::query(
            "INSERT INTO status_history \
             (status_id, created_at, online, down, max_players, num_players, players) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(status_id.0)
        .bind(point.created_at)
        .bind(point.online)
        .bind(point.down)
        .bind(encode_count(point.max_players))
        .bind(encode_count(point.num_players))
        .bind(&point.players)
        .execute(&mut *tx)
        .await?;

        for change in &report.query_changes {
            let (query, result) = match change {
                QueryChange::Failed { query, since } => (
                    *query,
                    sqlx::query(
                        "UPDATE status_query SET failed_at = COALESCE(failed_at, $1) \
                         WHERE status_query_id = $2",
                    )
                    .bind(since)
                    .bind(query.0)
                    .execute(&mut *tx)
                    .await?,
                ),
                QueryChange::Recovered { query } => (
                    *query,
                    sqlx::query("UPDATE status_query SET failed_at = NULL WHERE status_query_id = $1")
                        .bind(query.0)
                        .execute(&mut *tx)
                        .await?,
                ),
                QueryChange::Disabled { query, at, .. } => (
                    *query,
                    sqlx::query(
                        "UPDATE status_query SET enabled_at = NULL, failed_at = $1 \
                         WHERE status_query_id = $2",
                    )
                    .bind(at)
                    .bind(query.0)
                    .execute(&mut *tx)
                    .await?,
                ),
            };
            if result.rows_affected() == 0 {
                return Err(StoreError::UnknownQuery(query));
            }
        }

        if let Some(cache) = &report.cache {
            sqlx::query(
                "UPDATE status SET \
                 title     = COALESCE($1, title), \
                 address   = COALESCE($2, address), \
                 thumbnail = COALESCE($3, thumbnail), \
                 game      = COALESCE($4, game), \
                 map       = COALESCE($5, map), \
                 version   = COALESCE($6, version) \
                 WHERE status_id = $7",
            )
            .bind(&cache.title)
            .bind(&cache.address)
            .bind(&cache.thumbnail)
            .bind(&cache.game)
            .bind(&cache.map)
            .bind(&cache.version)
            .bind(status_id.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn prune_history(
        &self,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM status_history WHERE created_at < $1")
            .bind(now - retention.history)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            "UPDATE status_history SET players = '{}' \
             WHERE created_at < $1 AND cardinality(players) > 0",
        )
        .bind(now - retention.players)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(deleted)
    }
}
