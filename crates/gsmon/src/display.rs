//! ポーリング結果を表示側へ流すフィード。

use tokio::sync::mpsc;
use tracing::info;

use crate::poller::PollOutcome;

/// スケジューラが受信側を待つまでにバッファする件数。
pub const DISPLAY_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayUpdate {
    pub outcome: PollOutcome,
    /// サムネイルなどのキャッシュ済みアセットを再アップロードする
    pub refresh_attachments: bool,
}

/// ユーザーに見せるステータスの大まかな状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Online,
    /// 失敗中だがまだダウンではない。グラフではこの点を除外する
    Intermediary,
    Offline,
}

impl DisplayUpdate {
    pub fn state(&self) -> DisplayState {
        if self.outcome.online {
            DisplayState::Online
        } else if self.outcome.intermediary {
            DisplayState::Intermediary
        } else {
            DisplayState::Offline
        }
    }
}

/// 送信側が全て無くなるまで、フィードをログに書き出す。
pub async fn log_updates(mut rx: mpsc::Receiver<DisplayUpdate>) {
    while let Some(update) = rx.recv().await {
        let outcome = &update.outcome;
        info!(
            status_id = %outcome.status_id,
            label = %outcome.label,
            state = ?update.state(),
            players = outcome.num_players,
            max_players = outcome.max_players,
            address = outcome.address.as_deref(),
            game = outcome.game.as_deref(),
            map = outcome.map.as_deref(),
            refresh_attachments = update.refresh_attachments,
            "Status updated"
        );
    }
}
