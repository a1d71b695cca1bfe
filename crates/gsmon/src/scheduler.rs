//! 有効な全ステータスを定期的にポーリングする。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::alert::AlertDispatcher;
use crate::display::DisplayUpdate;
use crate::downtime::DOWN_AFTER;
use crate::model::StatusEntry;
use crate::poller::StatusPoller;
use crate::store::{Retention, StatusStore, StoreError};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub attachment_interval: Duration,
    /// 同時にポーリングするステータス数
    pub max_concurrency: usize,
    pub retention: Retention,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            attachment_interval: Duration::from_secs(600),
            max_concurrency: 1,
            retention: Retention::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub polled: usize,
    pub online: usize,
    pub down: usize,
    /// 有効なクエリが無いステータス
    pub skipped: usize,
    /// 結果を保存できなかったステータス
    pub failed: usize,
    pub alerts: usize,
}

enum StatusResult {
    Skipped,
    Recorded { online: bool, down: bool, alerts: usize },
}

/// ポーリングに必要なもの一式。起動時に一度だけ作る。
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn StatusStore>,
    poller: Arc<StatusPoller>,
    alerts: Arc<AlertDispatcher>,
    display: mpsc::Sender<DisplayUpdate>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StatusStore>,
        poller: StatusPoller,
        alerts: AlertDispatcher,
        display: mpsc::Sender<DisplayUpdate>,
        mut settings: SchedulerSettings,
    ) -> Self {
        settings.max_concurrency = settings.max_concurrency.max(1);
        settings.interval = settings.interval.max(MIN_INTERVAL);
        Self {
            store,
            poller: Arc::new(poller),
            alerts: Arc::new(alerts),
            display,
            settings,
        }
    }

    /// ポーリングを繰り返す。初回は壁時計で次の
    /// 間隔の倍数になるまで待つ。
    pub async fn run(&self) {
        let interval = self.settings.interval;
        let delay = delay_until_aligned(Utc::now(), interval);
        info!(
            interval = %humantime::format_duration(interval),
            first_in = %humantime::format_duration(delay),
            max_concurrency = self.settings.max_concurrency,
            "Starting scheduler"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + delay, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_refresh: Option<Instant> = None;

        loop {
            let tick = ticker.tick().await;
            let refresh = last_refresh
                .is_none_or(|at| tick.duration_since(at) >= self.settings.attachment_interval);
            if refresh {
                last_refresh = Some(tick);
            }

            let started = Instant::now();
            match self.tick(Utc::now(), refresh).await {
                Ok(summary) => info!(
                    polled = summary.polled,
                    online = summary.online,
                    down = summary.down,
                    failed = summary.failed,
                    alerts = summary.alerts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sweep finished"
                ),
                Err(e) => error!(error = ?e, "Sweep failed"),
            }
        }
    }

    /// 有効な全ステータスを 1 回ずつポーリングする。
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        refresh_attachments: bool,
    ) -> anyhow::Result<TickSummary> {
        let entries = self
            .store
            .enabled_statuses()
            .await
            .context("Failed to load enabled statuses")?;
        debug!(statuses = entries.len(), "Starting sweep");

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let mut tasks = JoinSet::new();
        for entry in entries {
            let scheduler = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let status_id = entry.status.id;
                let _permit = semaphore.acquire_owned().await;
                let result = scheduler.poll_status(entry, now, refresh_attachments).await;
                (status_id, result)
            });
        }

        let mut summary = TickSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(StatusResult::Skipped))) => summary.skipped += 1,
                Ok((_, Ok(StatusResult::Recorded { online, down, alerts }))) => {
                    summary.polled += 1;
                    summary.online += usize::from(online);
                    summary.down += usize::from(down);
                    summary.alerts += alerts;
                }
                Ok((status_id, Err(e))) => {
                    summary.failed += 1;
                    error!(%status_id, error = %e, "Failed to record poll");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(error = %e, "Poll task panicked");
                }
            }
        }

        if refresh_attachments {
            match self.store.prune_history(now, &self.settings.retention).await {
                Ok(removed) => debug!(removed, "Pruned history"),
                Err(e) => error!(error = %e, "Failed to prune history"),
            }
        }

        Ok(summary)
    }

    async fn poll_status(
        &self,
        entry: StatusEntry,
        now: DateTime<Utc>,
        refresh_attachments: bool,
    ) -> Result<StatusResult, StoreError> {
        let history = self
            .store
            .recent_history(entry.status.id, DOWN_AFTER - 1)
            .await?;
        let Some(report) = self.poller.poll(&entry, &history, now).await else {
            return Ok(StatusResult::Skipped);
        };

        // 保存できた結果だけをアラートと表示に回す
        self.store.record_poll(&report).await?;
        self.alerts.dispatch(&report.alerts).await;

        let result = StatusResult::Recorded {
            online: report.outcome.online,
            down: report.outcome.down,
            alerts: report.alerts.len(),
        };
        let update = DisplayUpdate {
            outcome: report.outcome,
            refresh_attachments,
        };
        if self.display.send(update).await.is_err() {
            debug!("Display feed closed");
        }
        Ok(result)
    }
}

/// `now` から、エポックからの `interval` の次の倍数までの時間。
pub fn delay_until_aligned(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_ms = interval.as_millis();
    if interval_ms == 0 {
        return Duration::ZERO;
    }
    let elapsed_ms = u128::try_from(now.timestamp_millis()).unwrap_or_default();
    let remainder = elapsed_ms % interval_ms;
    if remainder == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((interval_ms - remainder) as u64)
    }
}
