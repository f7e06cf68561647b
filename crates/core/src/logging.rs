//! Tracing setup for the cx market-data client.
//!
//! [`init_tracing`] installs one global subscriber: an `EnvFilter` (from
//! `RUST_LOG`, `info` when unset), the [`SecretSanitizer`] and a formatter
//! writing either JSON lines or pretty text. Output goes to stdout unless
//! `log.file` is set, in which case it is appended to
//! `log.path/log.filename` without ANSI colors.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::fmt::format::{FmtSpan, Writer};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

/// Install the global subscriber described by `cfg`.
///
/// Fails when the log file cannot be opened or a subscriber is already
/// installed.
pub fn init_tracing(cfg: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, ansi) = open_output(cfg)?;

    let output = if cfg.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(UtcNanos)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_timer(UtcNanos)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(SecretSanitizer)
        .with(output)
        .try_init()
        .context("tracing subscriber already installed")?;
    Ok(())
}

/// Writer for the configured destination, and whether colors make sense
/// on it.
fn open_output(cfg: &LogConfig) -> Result<(BoxMakeWriter, bool)> {
    if !cfg.file {
        return Ok((BoxMakeWriter::new(std::io::stdout), true));
    }
    std::fs::create_dir_all(&cfg.path)
        .with_context(|| format!("failed to create log directory {}", cfg.path))?;
    let path = cfg.file_path();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok((BoxMakeWriter::new(Arc::new(file)), false))
}

/// RFC 3339 UTC timestamps with nanosecond precision.
#[derive(Debug, Clone, Copy)]
struct UtcNanos;

impl FormatTime for UtcNanos {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

/// Why a field looks like it carries a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exposure {
    /// Field named after a credential.
    Name,
    /// 64 hex digits: the shape of an auth signature.
    Signature,
    /// Long unbroken mixed-case alphanumeric token: the shape of an API key
    /// or secret.
    Token,
}

/// Fields whose name alone marks them as credentials.
const CREDENTIAL_FIELDS: &[&str] = &["key", "api_key", "api_secret", "secret", "signature"];

/// Shortest value treated as a possible API key.
const MIN_TOKEN_LEN: usize = 24;

fn exposure_of_value(value: &str) -> Option<Exposure> {
    if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(Exposure::Signature);
    }
    if value.len() >= MIN_TOKEN_LEN
        && value.bytes().all(|b| b.is_ascii_alphanumeric())
        && value.bytes().any(|b| b.is_ascii_uppercase())
        && value.bytes().any(|b| b.is_ascii_lowercase())
        && value.bytes().any(|b| b.is_ascii_digit())
    {
        return Some(Exposure::Token);
    }
    None
}

/// Layer that warns when a span or event records something credential-like.
///
/// It cannot stop the record from being written; the warning names the
/// field and the callsite so the leak can be fixed.
#[derive(Debug, Clone, Copy)]
pub struct SecretSanitizer;

impl SecretSanitizer {
    fn report(found: Option<(&'static str, Exposure)>, callsite: &str) {
        if let Some((field, exposure)) = found {
            tracing::warn!(
                field,
                exposure = ?exposure,
                callsite,
                "credential-like value recorded, it must not be logged"
            );
        }
    }
}

impl<S> Layer<S> for SecretSanitizer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, _id: &span::Id, _ctx: LayerContext<'_, S>) {
        let mut scan = CredentialScan::default();
        attrs.record(&mut scan);
        Self::report(scan.found, attrs.metadata().name());
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut scan = CredentialScan::default();
        event.record(&mut scan);
        Self::report(scan.found, event.metadata().target());
    }
}

/// First credential-like field of one record.
#[derive(Default)]
struct CredentialScan {
    found: Option<(&'static str, Exposure)>,
}

impl CredentialScan {
    fn note(&mut self, field: &Field, exposure: Option<Exposure>) {
        if self.found.is_none() {
            self.found = exposure.map(|e| (field.name(), e));
        }
    }

    fn named(field: &Field) -> Option<Exposure> {
        CREDENTIAL_FIELDS
            .contains(&field.name())
            .then_some(Exposure::Name)
    }
}

impl Visit for CredentialScan {
    fn record_debug(&mut self, field: &Field, _value: &dyn fmt::Debug) {
        self.note(field, Self::named(field));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.note(field, Self::named(field).or_else(|| exposure_of_value(value)));
    }
}
