use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// クエリを無効化するまでの連続失敗時間のデフォルト値。
pub const DEFAULT_DISABLE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// 一時的な失敗を 1 回記録した結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// 猶予期間内。`since` は連続失敗の開始日時
    Failing { since: DateTime<Utc> },
    /// しきい値以上失敗し続けているので無効化する
    Expired { since: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy)]
pub struct AutoDisablePolicy {
    disable_after: TimeDelta,
}

impl AutoDisablePolicy {
    pub fn new(disable_after: Duration) -> Self {
        Self {
            disable_after: TimeDelta::from_std(disable_after).unwrap_or(TimeDelta::MAX),
        }
    }

    /// `failed_at` はクエリに保存されている連続失敗の開始日時。
    pub fn on_failure(&self, failed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> FailureVerdict {
        let since = failed_at.unwrap_or(now);
        if now.signed_duration_since(since) >= self.disable_after {
            FailureVerdict::Expired { since }
        } else {
            FailureVerdict::Failing { since }
        }
    }
}

impl Default for AutoDisablePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DISABLE_AFTER)
    }
}
