use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use gsmon::alert::{AlertDispatcher, DiscordSink, LogSink};
use gsmon::autodisable::AutoDisablePolicy;
use gsmon::config::{Config, open_config, write_default_config};
use gsmon::display::{DISPLAY_BUFFER, DisplayUpdate, log_updates};
use gsmon::protocol::ProtocolTable;
use gsmon::resolver::{HickoryLookup, Resolver};
use gsmon::runner::QueryRunner;
use gsmon::store::PgStore;
use gsmon::version::{long_version, short_version};
use gsmon::{Scheduler, StatusPoller};

#[derive(Parser)]
#[command(version = short_version())]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// デフォルトの設定ファイルを書き出して終了する
    #[arg(long)]
    init: bool,

    /// 1 回だけポーリングして終了する
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    if args.init {
        write_default_config(&args.config)?;
        info!(path = ?args.config, "Created default configuration");
        return Ok(());
    }

    info!(version = long_version(), "gsmon version");

    let config = open_config(&args.config).context("Failed to load configuration")?;
    info!(
        interval = %humantime::format_duration(config.poll.interval),
        max_concurrency = config.poll.max_concurrency,
        discord = config.discord.is_some(),
        "Configuration loaded"
    );

    let (display_tx, display_rx) = mpsc::channel(DISPLAY_BUFFER);
    let display = tokio::spawn(log_updates(display_rx));
    let scheduler = build_scheduler(&config, display_tx).await?;

    if args.once {
        let summary = scheduler.tick(Utc::now(), true).await?;
        info!(?summary, "Sweep finished");
        // 終了前に表示フィードを流し切る
        drop(scheduler);
        display.await.context("Display task failed")?;
        return Ok(());
    }

    tokio::select! {
        _ = scheduler.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
        }
    }
    Ok(())
}

async fn build_scheduler(
    config: &Config,
    display: mpsc::Sender<DisplayUpdate>,
) -> Result<Scheduler> {
    let store = PgStore::connect(&config.database.url)
        .await
        .context("Failed to open database")?;

    let dns = HickoryLookup::from_system_conf(config.poll.dns_timeout)?;
    let protocols = ProtocolTable::standard(config.poll.query_timeout)?;
    let runner = QueryRunner::new(
        Resolver::new(Arc::new(dns)),
        protocols,
        config.poll.query_timeout,
    );
    let poller = StatusPoller::new(runner, AutoDisablePolicy::new(config.poll.disable_after));

    let mut alerts = AlertDispatcher::new().with_sink(Arc::new(LogSink));
    if let Some(discord) = &config.discord {
        alerts = alerts.with_sink(Arc::new(DiscordSink::new(
            &discord.token,
            discord.audit_channel_id,
            discord.downtime_channel_id,
        )));
    }

    Ok(Scheduler::new(
        Arc::new(store),
        poller,
        alerts,
        display,
        config.scheduler_settings(),
    ))
}
