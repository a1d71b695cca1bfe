//! ゲームサーバーのステータス監視。各ゲーム固有のクエリプロトコルで
//! サーバーを問い合わせ、結果を up/down に平滑化してアラートを出す。

pub mod alert;
pub mod autodisable;
pub mod config;
pub mod display;
pub mod downtime;
pub mod error;
pub mod model;
pub mod poller;
pub mod protocol;
pub mod resolver;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{FailureClass, QueryFailure};
pub use model::{HistoryPoint, ProtocolKind, Query, QueryId, Status, StatusEntry, StatusId};
pub use poller::{PollOutcome, PollReport, StatusPoller};
pub use scheduler::{Scheduler, SchedulerSettings};
