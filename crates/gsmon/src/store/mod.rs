//! ステータス、クエリ、履歴の永続化。

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::model::{HistoryPoint, QueryId, StatusEntry, StatusId};
use crate::poller::PollReport;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("history for status {status} must be newer than {last}, got {attempted}")]
    HistoryOutOfOrder {
        status: StatusId,
        last: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    #[error("unknown status {0}")]
    UnknownStatus(StatusId),
    #[error("unknown query {0}")]
    UnknownQuery(QueryId),
    #[error("status label `{label}` is already used in guild {guild_id}")]
    DuplicateLabel { guild_id: u64, label: String },
    #[error("status {status} already has a query for {address}")]
    DuplicateQuery { status: StatusId, address: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// 履歴の保持期間。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// これより古い履歴は削除する
    pub history: TimeDelta,
    /// これより古い履歴からはプレイヤー名を消す
    pub players: TimeDelta,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            history: TimeDelta::days(30),
            players: TimeDelta::hours(1),
        }
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// 有効なステータスを、有効なクエリ (優先度、ID 順) 付きで返す。
    async fn enabled_statuses(&self) -> Result<Vec<StatusEntry>, StoreError>;

    /// 最新の履歴を最大 `limit` 件、新しい順で返す。
    async fn recent_history(
        &self,
        status: StatusId,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, StoreError>;

    /// `report` の内容をまとめてアトミックに反映する。
    async fn record_poll(&self, report: &PollReport) -> Result<(), StoreError>;

    /// 削除した履歴の件数を返す。
    async fn prune_history(
        &self,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<u64, StoreError>;
}
