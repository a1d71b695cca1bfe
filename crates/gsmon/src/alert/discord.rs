use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serenity::all::{ChannelId, CreateEmbed, CreateEmbedFooter, CreateMessage, Http};

use super::{AlertChannel, AlertEvent, AlertSink};

const RED: u32 = 0xdd2e44;
const GREEN: u32 = 0x77b255;
const ORANGE: u32 = 0xf4900c;

/// Discord の REST API でアラートを Embed として投稿する。
pub struct DiscordSink {
    http: Arc<Http>,
    audit_channel: ChannelId,
    downtime_channel: ChannelId,
}

impl DiscordSink {
    pub fn new(token: &str, audit_channel_id: u64, downtime_channel_id: u64) -> Self {
        Self {
            http: Arc::new(Http::new(token)),
            audit_channel: ChannelId::new(audit_channel_id),
            downtime_channel: ChannelId::new(downtime_channel_id),
        }
    }

    fn embed(event: &AlertEvent) -> CreateEmbed {
        let color = match event {
            AlertEvent::WentOffline { .. } => RED,
            AlertEvent::BackOnline { .. } => GREEN,
            AlertEvent::QueryDisabled { .. } => ORANGE,
        };
        CreateEmbed::new()
            .title(event.title())
            .description(event.description())
            .color(color)
            .footer(CreateEmbedFooter::new(format!("Status {}", event.status().id)))
    }
}

#[async_trait]
impl AlertSink for DiscordSink {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn deliver(&self, event: &AlertEvent) -> anyhow::Result<()> {
        let channel = match event.channel() {
            AlertChannel::Audit => self.audit_channel,
            AlertChannel::Downtime => self.downtime_channel,
        };
        let message = CreateMessage::new().embed(Self::embed(event));
        channel
            .send_message(&self.http, message)
            .await
            .with_context(|| format!("Failed to post alert to channel {channel}"))?;
        Ok(())
    }
}
