//! Layered configuration for the cx market-data client.
//!
//! Configuration is loaded in layers with increasing priority:
//! 1. Compiled-in defaults (public endpoint, depth 6, queue capacity 16)
//! 2. TOML configuration file (if provided)
//! 3. Environment variable overrides (prefix `CX_MD_`, nested with `__`)
//! 4. Specific env vars for API credentials (`CEXIO_API_KEY`, `CEXIO_API_SECRET`)
//!
//! Credentials should come from environment variables so they never end up
//! in a checked-in configuration file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::types::Pair;

// ── Default value functions ────────────────────────────────────────────

fn default_ws_url() -> String {
    "wss://ws.cex.io/ws".to_string()
}

fn default_authenticate() -> bool {
    true
}

fn default_pairs() -> Vec<String> {
    vec!["BTC:USD".to_string()]
}

/// Default retained book depth N: 6 levels per side.
fn default_book_depth() -> usize {
    6
}

/// Default depth requested from the exchange on subscribe.
fn default_subscribe_depth() -> u32 {
    5
}

/// Default stage queue capacity: 16 messages.
fn default_queue_capacity() -> usize {
    16
}

/// Default ticker poll interval: 2 000 ms.
fn default_ticker_interval_ms() -> u64 {
    2_000
}

fn default_auto_resync() -> bool {
    true
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_log_path() -> String {
    ".".to_string()
}

fn default_log_filename() -> String {
    "marketdata.log".to_string()
}

fn default_publish_addr() -> String {
    "127.0.0.1:38201".to_string()
}

fn default_render_enabled() -> bool {
    true
}

fn default_render_interval_ms() -> u64 {
    1_000
}

// ── Configuration structs ──────────────────────────────────────────────

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Exchange connection and credentials.
    pub exchange: ExchangeConfig,
    /// Subscriptions, book shape and pipeline sizing.
    pub market_data: MarketDataConfig,
    /// Log output.
    #[serde(default)]
    pub log: LogConfig,
    /// UDP snapshot relay.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Terminal renderer.
    #[serde(default)]
    pub render: RenderConfig,
}

/// Exchange connection configuration.
#[derive(Clone, Deserialize)]
pub struct ExchangeConfig {
    /// WebSocket endpoint.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// API key, normally from `CEXIO_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    /// API secret, normally from `CEXIO_API_SECRET`.
    #[serde(default)]
    pub api_secret: String,
    /// Send the signed `auth` request after every connect.
    #[serde(default = "default_authenticate")]
    pub authenticate: bool,
}

// Hand-written so credentials never reach a log line through `{:?}`.
impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("ws_url", &self.ws_url)
            .field("api_key", &redact(&self.api_key))
            .field("api_secret", &redact(&self.api_secret))
            .field("authenticate", &self.authenticate)
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

/// Market data subscription configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    /// Instruments to subscribe to, canonical `BASE:QUOTE`.
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,
    /// Levels retained per side (N).
    #[serde(default = "default_book_depth")]
    pub book_depth: usize,
    /// Depth requested in `order-book-subscribe`.
    #[serde(default = "default_subscribe_depth")]
    pub subscribe_depth: u32,
    /// Capacity of every bounded stage queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Ticker poll period per subscribed pair. `0` disables polling.
    #[serde(default = "default_ticker_interval_ms")]
    pub ticker_interval_ms: u64,
    /// Unsubscribe and resubscribe a pair after a sequence desync.
    #[serde(default = "default_auto_resync")]
    pub auto_resync: bool,
    /// Reconnect parameters.
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// Transport reconnect parameters with exponential backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Consecutive failed attempts before giving up. `0` = unlimited.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Directory of the log file.
    #[serde(default = "default_log_path")]
    pub path: String,
    /// Log file name inside `path`.
    #[serde(default = "default_log_filename")]
    pub filename: String,
    /// Write to `path/filename` instead of stdout.
    #[serde(default)]
    pub file: bool,
    /// JSON lines instead of pretty output.
    #[serde(default)]
    pub json: bool,
}

/// UDP relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Destination `ip:port` for snapshot datagrams.
    #[serde(default = "default_publish_addr")]
    pub publish_addr: String,
}

/// Terminal renderer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_render_enabled")]
    pub enabled: bool,
    #[serde(default = "default_render_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            filename: default_log_filename(),
            file: false,
            json: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            publish_addr: default_publish_addr(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enabled: default_render_enabled(),
            interval_ms: default_render_interval_ms(),
        }
    }
}

impl LogConfig {
    /// Full path of the log file.
    pub fn file_path(&self) -> PathBuf {
        PathBuf::from(&self.path).join(&self.filename)
    }
}

impl MarketDataConfig {
    /// Configured pairs in canonical form.
    pub fn parsed_pairs(&self) -> Result<Vec<Pair>> {
        self.pairs
            .iter()
            .map(|p| Pair::parse(p).with_context(|| format!("invalid pair {p:?}")))
            .collect()
    }

    pub fn ticker_interval(&self) -> Option<Duration> {
        (self.ticker_interval_ms > 0).then(|| Duration::from_millis(self.ticker_interval_ms))
    }
}

impl AppConfig {
    /// Load configuration using layered sources.
    ///
    /// 1. Compiled-in defaults.
    /// 2. TOML file at `config_path` (if `Some`).
    /// 3. Environment variable overrides with prefix `CX_MD_` and `__` as the
    ///    nesting separator (e.g., `CX_MD_MARKET_DATA__BOOK_DEPTH=10`).
    /// 4. Credentials from `CEXIO_API_KEY` and `CEXIO_API_SECRET`.
    ///
    /// After loading, validates book shape, pairs and, when authentication is
    /// enabled, that credentials are present.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder()
            // ── Layer 1: compiled-in defaults ───────────────────────
            .set_default("exchange.ws_url", default_ws_url())?
            .set_default("exchange.api_key", "")?
            .set_default("exchange.api_secret", "")?
            .set_default("exchange.authenticate", true)?
            .set_default("market_data.pairs", default_pairs())?
            .set_default("market_data.book_depth", 6i64)?
            .set_default("market_data.subscribe_depth", 5i64)?
            .set_default("market_data.queue_capacity", 16i64)?
            .set_default("market_data.ticker_interval_ms", 2000i64)?
            .set_default("market_data.auto_resync", true)?
            .set_default("market_data.reconnect.initial_backoff_ms", 1000i64)?
            .set_default("market_data.reconnect.max_backoff_ms", 30000i64)?
            .set_default("market_data.reconnect.max_retries", 10i64)?;

        // ── Layer 2: TOML file ─────────────────────────────────────
        if let Some(path) = config_path {
            let path_str = path.to_str().context("config path is not valid UTF-8")?;
            builder = builder.add_source(File::with_name(path_str).required(true));
        }

        // ── Layer 3: env var overrides (CX_MD_ prefix) ────────────
        // The prefix separator has to be set explicitly, otherwise the
        // `config` crate reuses `__` and expects `CX_MD__...`.
        builder = builder.add_source(
            Environment::with_prefix("CX_MD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: AppConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        // ── Layer 4: dedicated credential env vars ─────────────────
        if let Ok(v) = std::env::var("CEXIO_API_KEY") {
            cfg.exchange.api_key = v;
        }
        if let Ok(v) = std::env::var("CEXIO_API_SECRET") {
            cfg.exchange.api_secret = v;
        }

        // ── Validation ─────────────────────────────────────────────
        cfg.validate()?;

        Ok(cfg)
    }

    /// Log settings to install. The terminal renderer owns stdout, so with
    /// rendering on, log output always goes to the log file.
    pub fn log_output(&self) -> LogConfig {
        let mut log = self.log.clone();
        if self.render.enabled && !log.file {
            log.file = true;
        }
        log
    }

    /// Validate configuration invariants.
    fn validate(&self) -> Result<()> {
        if self.exchange.authenticate
            && (self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty())
        {
            bail!("API key and secret are required when exchange.authenticate is set");
        }
        if self.market_data.book_depth == 0 {
            bail!("market_data.book_depth must be at least 1");
        }
        if self.market_data.queue_capacity == 0 {
            bail!("market_data.queue_capacity must be at least 1");
        }
        if self.market_data.reconnect.initial_backoff_ms > self.market_data.reconnect.max_backoff_ms
        {
            bail!("market_data.reconnect.initial_backoff_ms exceeds max_backoff_ms");
        }
        self.market_data.parsed_pairs()?;
        if self.relay.enabled {
            self.relay
                .publish_addr
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("invalid relay.publish_addr {:?}", self.relay.publish_addr))?;
        }
        Ok(())
    }
}
