//! ポーラーと永続化層の間で共有するレコード。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub i64);

impl fmt::Display for StatusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// サーバーの問い合わせに使うプロトコル。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    Arma3,
    ArmaReforger,
    Source,
    ProjectZomboid,
    MinecraftJava,
    MinecraftBedrock,
    Fivem,
    Teamspeak3,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 8] = [
        ProtocolKind::Arma3,
        ProtocolKind::ArmaReforger,
        ProtocolKind::Source,
        ProtocolKind::ProjectZomboid,
        ProtocolKind::MinecraftJava,
        ProtocolKind::MinecraftBedrock,
        ProtocolKind::Fivem,
        ProtocolKind::Teamspeak3,
    ];

    /// クエリと一緒に保存されるタグ
    pub fn tag(self) -> &'static str {
        match self {
            ProtocolKind::Arma3 => "arma3",
            ProtocolKind::ArmaReforger => "arma-reforger",
            ProtocolKind::Source => "source",
            ProtocolKind::ProjectZomboid => "project-zomboid",
            ProtocolKind::MinecraftJava => "minecraft-java",
            ProtocolKind::MinecraftBedrock => "minecraft-bedrock",
            ProtocolKind::Fivem => "fivem",
            ProtocolKind::Teamspeak3 => "teamspeak3",
        }
    }

    /// アラートで使う表示名
    pub fn label(self) -> &'static str {
        match self {
            ProtocolKind::Arma3 => "Arma 3",
            ProtocolKind::ArmaReforger => "Arma Reforger",
            ProtocolKind::Source => "Source",
            ProtocolKind::ProjectZomboid => "Project Zomboid",
            ProtocolKind::MinecraftJava => "Minecraft: Java Edition",
            ProtocolKind::MinecraftBedrock => "Minecraft: Bedrock Edition",
            ProtocolKind::Fivem => "FiveM",
            ProtocolKind::Teamspeak3 => "TeamSpeak 3",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol tag: {0}")]
pub struct UnknownProtocol(pub String);

impl FromStr for ProtocolKind {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProtocolKind::ALL
            .into_iter()
            .find(|kind| kind.tag() == s)
            .ok_or_else(|| UnknownProtocol(s.to_string()))
    }
}

/// 監視対象のサーバー 1 台。
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub id: StatusId,
    pub guild_id: u64,
    pub label: String,
    pub enabled_at: Option<DateTime<Utc>>,
    /// クエリ成功のたびに書き込まれるキャッシュ
    pub title: Option<String>,
    pub address: Option<String>,
    pub thumbnail: Option<Vec<u8>>,
    pub game: Option<String>,
    pub map: Option<String>,
    pub version: Option<String>,
}

impl Status {
    pub fn is_enabled(&self) -> bool {
        self.enabled_at.is_some()
    }

    /// アラートに出す名前。サーバー自身のタイトルを優先する。
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.label)
    }
}

/// [`Status`] に紐づく問い合わせ方法 1 つ。
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub id: QueryId,
    pub status_id: StatusId,
    pub host: String,
    /// `0` の場合は SRV レコードを引く
    pub port: u16,
    pub kind: ProtocolKind,
    /// 小さいほど先に試す
    pub priority: u32,
    pub enabled_at: Option<DateTime<Utc>>,
    /// 連続失敗が始まった日時
    pub failed_at: Option<DateTime<Utc>>,
    /// プロトコル固有の設定。通常は JSON オブジェクト
    pub extra: String,
}

impl Query {
    pub fn is_enabled(&self) -> bool {
        self.enabled_at.is_some()
    }

    /// ユーザーが設定したままのアドレス (例: `play.example.com:25565`)。
    pub fn address(&self) -> String {
        if self.port == 0 {
            self.host.clone()
        } else if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// ステータスと、試行順に並べた有効なクエリ。
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub status: Status,
    pub queries: Vec<Query>,
}

/// ステータスの時系列 1 行分。
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub created_at: DateTime<Utc>,
    pub online: bool,
    /// ヒステリシスで平滑化したダウンフラグ
    pub down: bool,
    pub max_players: Option<u32>,
    pub num_players: Option<u32>,
    pub players: Vec<String>,
}
