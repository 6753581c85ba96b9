//! CLI command implementations

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::Application;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::journal::{Family, JournalStore, QueryFilter};
use crate::ports::{ChannelNotifier, PaperBroker, RestMarketData, StaticMarketData};
use crate::scheduler::{ControlCommand, Scheduler};

/// Build the application for the configured mode. Order routing always uses
/// the sandbox account; a live broker transport plugs in through the
/// `BrokerPort` trait.
async fn build_app(config: Config) -> Result<Arc<Application>> {
    let journal = Arc::new(
        JournalStore::open(&config.journal.data_dir, config.journal.retention_days).await?,
    );
    let broker = Arc::new(PaperBroker::new(100_000.0));
    let (notifier, mut outbound_rx, reply_rx) = ChannelNotifier::new(
        std::time::Duration::from_secs(config.notifier.dedup_window_secs),
    );
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            info!("[notify] {}", message.text);
        }
    });

    let market: Arc<dyn crate::ports::MarketDataPort> = if config.trading.paper_trading {
        Arc::new(StaticMarketData::new())
    } else {
        let api_key = std::env::var("MARKET_DATA_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            warn!("MARKET_DATA_API_KEY not set; market data calls will be rejected upstream");
        }
        Arc::new(RestMarketData::with_deadlines(
            config.data.endpoint.clone(),
            api_key,
            config.data.market_data_deadline_ms,
            config.data.bulk_deadline_ms,
        ))
    };
    if !config.trading.paper_trading {
        warn!("Live data configured but order routing stays on the sandbox account");
    }

    let app = Arc::new(Application::new(
        config,
        Arc::new(SystemClock),
        market,
        broker,
        Arc::new(notifier),
        journal,
        vec![],
    ));
    app.spawn_reply_pump(reply_rx);
    Ok(app)
}

/// `run`: drive the full engine until ctrl-c
pub async fn run(config: Config) -> Result<()> {
    let app = build_app(config).await?;

    let scheduler = Arc::new(Scheduler::new(
        app.clock.clone(),
        app.calendar.clone(),
        app.config.schedule.clone(),
        (
            crate::config::parse_hhmm(&app.config.trading.trading_start_time)?,
            crate::config::parse_hhmm(&app.config.trading.trading_end_time)?,
        ),
        crate::config::parse_hhmm(&app.config.schedule.full_learning_time)?,
        app.journal.clone(),
    ));

    let token = CancellationToken::new();
    let controls = scheduler.controls();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; finishing the current tick");
                let _ = controls.send(ControlCommand::RequestShutdown).await;
                token.cancel();
            }
        });
    }

    scheduler.run(app.clone(), token).await;
    info!("Engine stopped cleanly");
    Ok(())
}

/// `screen`: one-shot screener pass, printed to stdout
pub async fn screen(config: Config) -> Result<()> {
    let app = build_app(config).await?;
    let watchlist = app.screener.refresh(Utc::now()).await?;

    if watchlist.degraded {
        println!("(degraded: served previous watchlist)");
    }
    if watchlist.entries.is_empty() {
        println!("No candidates passed screening.");
        return Ok(());
    }
    println!(
        "{:<8} {:>8} {:>8} {:>8} {:>6}  sector",
        "ticker", "price", "chg%", "relvol", "score"
    );
    for e in &watchlist.entries {
        println!(
            "{:<8} {:>8.2} {:>8.2} {:>8.2} {:>6.1}  {}",
            e.ticker, e.price, e.day_change_pct, e.relative_volume, e.momentum_score, e.sector
        );
    }
    Ok(())
}

/// `status`: read the journal and print a summary
pub async fn status(config: Config) -> Result<()> {
    let journal =
        JournalStore::open(&config.journal.data_dir, config.journal.retention_days).await?;

    println!("journal record counts:");
    let mut counts: Vec<_> = journal.counts().into_iter().collect();
    counts.sort_by_key(|(f, _)| f.file_stem());
    for (family, count) in counts {
        println!("  {:<16} {}", family.to_string(), count);
    }

    let decisions = journal.query(Family::Decisions, &QueryFilter::default(), 5);
    if !decisions.is_empty() {
        println!("\nrecent decisions:");
        for d in decisions {
            let ticker = d.payload["ticker"].as_str().unwrap_or("?");
            let action = d.payload["action"].as_str().unwrap_or("?");
            let confidence = d.payload["final_confidence"].as_f64().unwrap_or(0.0);
            let reason = d.payload["skip_reason"].as_str().unwrap_or("");
            println!(
                "  {} {} {} confidence {:.1} {}",
                d.created_at.format("%H:%M:%S"),
                ticker,
                action,
                confidence,
                reason
            );
        }
    }
    Ok(())
}

/// `learn`: force a full learning cycle
pub async fn learn(config: Config) -> Result<()> {
    let app = build_app(config).await?;
    match app.learning.run_cycle(Utc::now()).await? {
        Some(record) => {
            println!(
                "cycle over {} outcomes: validation {:.3} vs {:.3}, {}",
                record.outcomes_considered,
                record.validation_score,
                record.previous_validation_score,
                if record.committed {
                    format!("committed weights v{}", record.weights_version)
                } else {
                    "discarded".to_string()
                }
            );
            for insight in record.insights {
                println!("  - {insight}");
            }
        }
        None => println!("Not enough outcome history to learn from yet."),
    }
    Ok(())
}
