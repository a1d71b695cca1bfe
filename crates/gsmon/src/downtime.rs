//! 生のオンライン/オフライン結果を `down` フラグに平滑化する。
//! 1 回応答が無かっただけでは通知しない。

use std::collections::VecDeque;

use crate::model::HistoryPoint;

/// ダウンとみなすまでの連続失敗回数 (今回の結果を含む)。
pub const DOWN_AFTER: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOffline,
    BackOnline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub down: bool,
    pub transition: Option<Transition>,
}

/// 1 ステータスの直近の `online` 結果。新しい順。
#[derive(Debug, Clone, Default)]
pub struct DowntimeWindow {
    recent: VecDeque<bool>,
    down: bool,
}

impl DowntimeWindow {
    /// 保存済みの履歴 (新しい順) からウィンドウを作る。
    pub fn from_history(history: &[HistoryPoint]) -> Self {
        Self {
            recent: history
                .iter()
                .take(DOWN_AFTER - 1)
                .map(|point| point.online)
                .collect(),
            down: history.first().is_some_and(|point| point.down),
        }
    }

    /// 今回のポーリング結果を取り込む。
    ///
    /// 履歴が無い分はオフライン扱いなので、一度も応答していない
    /// ステータスは最初の失敗でダウンになる。
    pub fn observe(&mut self, online: bool) -> Verdict {
        let down = !online && self.recent.iter().all(|online| !online);

        let transition = match (self.down, down) {
            (false, true) => Some(Transition::WentOffline),
            (true, false) => Some(Transition::BackOnline),
            _ => None,
        };

        self.recent.push_front(online);
        self.recent.truncate(DOWN_AFTER - 1);
        self.down = down;

        Verdict { down, transition }
    }
}
