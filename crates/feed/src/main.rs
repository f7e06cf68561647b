//! CX Feed Binary
//!
//! Connects to the CEX.IO WebSocket API, subscribes to the configured pairs
//! and keeps their order books current. Books are redrawn in the terminal
//! and optionally relayed over UDP.

mod render;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use cx_core::config::AppConfig;
use cx_market_data::relay::Relay;
use cx_market_data::ws::WsConnector;
use cx_market_data::{BookEvent, MarketDataClient, SessionSettings};

/// CEX.IO order book feed
#[derive(Parser, Debug)]
#[command(name = "cx-feed", about = "CEX.IO streaming order book client")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config)?;

    cx_core::logging::init_tracing(&config.log_output())?;

    let pairs = config.market_data.parsed_pairs()?;
    tracing::info!(
        url = %config.exchange.ws_url,
        pairs = ?config.market_data.pairs,
        depth = config.market_data.book_depth,
        "starting cx-feed"
    );

    let cancel = CancellationToken::new();
    let connector = WsConnector::new(config.exchange.ws_url.clone());
    let (client, handles) =
        MarketDataClient::start(connector, SessionSettings::from_config(&config), cancel.clone());
    // Order-management replies have no consumer here.
    drop(handles.orders);

    // ── 1. Book events ───────────────────────────────────────────
    let mut events = handles.events;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BookEvent::Ready { pair, id } => tracing::info!(%pair, id, "book ready"),
                BookEvent::Desync { pair, error } => {
                    tracing::warn!(%pair, error = %error, "book desynchronized")
                }
                BookEvent::Removed { pair } => tracing::info!(%pair, "book removed"),
            }
        }
    });

    // ── 2. UDP relay ─────────────────────────────────────────────
    if config.relay.enabled {
        let relay = Relay::bind(&config.relay.publish_addr)
            .await
            .context("failed to start snapshot relay")?;
        tokio::spawn(relay.run(client.subscribe_snapshots(), cancel.clone()));
    }

    // ── 3. Terminal renderer ─────────────────────────────────────
    let mut renderer = None;
    if config.render.enabled {
        let screen = render::Screen::stdout()?;
        renderer = Some(tokio::spawn(render::run_renderer(
            client.books(),
            screen,
            Duration::from_millis(config.render.interval_ms.max(1)),
            cancel.clone(),
        )));
    }

    // ── 4. Handshake and subscriptions ───────────────────────────
    if config.exchange.authenticate {
        client.authenticate().await?;
    }
    for pair in pairs {
        client.subscribe(pair).await?;
    }

    // ── Shutdown signal ──────────────────────────────────────────
    let mut supervisor = handles.supervisor;
    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            Ok(())
        }
        joined = &mut supervisor => match joined {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::anyhow!("session supervisor panicked: {e}")),
        },
    };

    client.shutdown().await;
    // Let the renderer restore the terminal before exiting.
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }
    tracing::info!("cx-feed stopped");
    outcome
}
