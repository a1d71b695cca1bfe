use thiserror::Error;

use crate::model::ProtocolKind;

/// 1 回のクエリ試行が応答を得られなかった理由。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryFailure {
    #[error("DNS name does not exist")]
    NameNotFound,
    #[error("{0} does not support SRV lookups; a query port is required")]
    SrvUnsupported(ProtocolKind),
    #[error("Query timed out")]
    Timeout,
    #[error("Server unreachable: {0}")]
    Unreachable(String),
    #[error("Malformed reply: {0}")]
    ProtocolError(String),
}

/// [`QueryFailure`] に対するポーラーの扱い。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 次の tick で再試行する。ダウン判定と自動無効化の対象になる
    Transient,
    /// 設定のままでは成功し得ないので、即座に無効化する
    Configuration,
}

impl QueryFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            QueryFailure::NameNotFound | QueryFailure::SrvUnsupported(_) => {
                FailureClass::Configuration
            }
            QueryFailure::Timeout
            | QueryFailure::Unreachable(_)
            | QueryFailure::ProtocolError(_) => FailureClass::Transient,
        }
    }

    pub(crate) fn unreachable(err: impl ToString) -> Self {
        QueryFailure::Unreachable(err.to_string())
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        QueryFailure::ProtocolError(reason.into())
    }
}

impl From<std::io::Error> for QueryFailure {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => QueryFailure::Timeout,
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData => {
                QueryFailure::ProtocolError(err.to_string())
            }
            _ => QueryFailure::Unreachable(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for QueryFailure {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        QueryFailure::Timeout
    }
}

pub type Result<T> = std::result::Result<T, QueryFailure>;
