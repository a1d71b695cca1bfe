use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{QueryFailure, Result};
use crate::model::Query;
use crate::protocol::{ProtocolTable, Reply};
use crate::resolver::Resolver;

/// クエリを 1 回実行する。名前解決、問い合わせ、応答に無い項目の補完まで行う。
#[derive(Clone)]
pub struct QueryRunner {
    resolver: Resolver,
    protocols: ProtocolTable,
    timeout: Duration,
}

impl QueryRunner {
    pub fn new(resolver: Resolver, protocols: ProtocolTable, timeout: Duration) -> Self {
        Self {
            resolver,
            protocols,
            timeout,
        }
    }

    /// 名前解決と問い合わせで `timeout` の期限を共有する。
    pub async fn attempt(&self, query: &Query) -> Result<Reply> {
        let Some(protocol) = self.protocols.get(query.kind) else {
            return Err(QueryFailure::malformed(format!(
                "no protocol registered for {}",
                query.kind
            )));
        };

        let deadline = Instant::now() + self.timeout;
        let attempt = async {
            let endpoint = self
                .resolver
                .resolve(&query.host, query.port, query.kind, protocol.srv())
                .await?;
            debug!(query_id = %query.id, addr = %endpoint.addr, "Probing");
            let remaining = deadline.saturating_duration_since(Instant::now());
            protocol.probe(&endpoint, &query.extra, remaining).await
        };
        let mut reply = tokio::time::timeout_at(deadline, attempt).await??;

        if reply.address.is_none() {
            reply.address = Some(query.address());
        }
        Ok(reply)
    }
}
