//! Book rendering for the terminal.

use std::fmt::Write as FmtWrite;
use std::io::{self, IsTerminal, Stdout, Write};
use std::time::Duration;

use anyhow::Context;
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    style::Print,
    terminal::{Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand, QueueableCommand,
};
use tokio_util::sync::CancellationToken;

use cx_core::types::{BookSnapshot, Level};
use cx_market_data::BookHandle;

/// One book as a two-column table, asks on the right. Empty slots print
/// dashes.
pub fn render_book(snapshot: &BookSnapshot) -> String {
    let mut out = String::new();
    let t = &snapshot.ticker;
    let _ = writeln!(out, "{}  id {}", snapshot.pair, snapshot.id);
    let _ = writeln!(
        out,
        "last {:.4}  low {:.4}  high {:.4}  vol {:.4}",
        t.last, t.low, t.high, t.volume
    );
    let _ = writeln!(out, "{:>14} {:>14} | {:<14} {:<14}", "bid qty", "bid", "ask", "ask qty");
    for (bid, ask) in snapshot.bids.iter().zip(&snapshot.asks) {
        let (bid_qty, bid_px) = cells(bid);
        let (ask_qty, ask_px) = cells(ask);
        let _ = writeln!(out, "{bid_qty:>14} {bid_px:>14} | {ask_px:<14} {ask_qty:<14}");
    }
    if let Some(spread) = snapshot.spread() {
        let _ = writeln!(out, "spread {spread:.4}");
    }
    out
}

fn cells(level: &Level) -> (String, String) {
    if level.is_empty() {
        ("-".to_string(), "-".to_string())
    } else {
        (format!("{:.4}", level.qty), format!("{:.4}", level.price))
    }
}

/// Redraws whole frames in place. Without a terminal, frames are appended
/// as plain text.
pub struct Screen<W: Write> {
    out: W,
    interactive: bool,
}

impl Screen<Stdout> {
    /// Take over stdout, switching to the alternate screen when it is a
    /// terminal.
    pub fn stdout() -> anyhow::Result<Self> {
        let mut out = io::stdout();
        let interactive = out.is_terminal();
        if interactive {
            out.execute(EnterAlternateScreen)
                .context("failed to enter alternate terminal screen")?;
            out.execute(Hide).context("failed to hide terminal cursor")?;
        }
        Ok(Self { out, interactive })
    }
}

impl<W: Write> Screen<W> {
    pub fn new(out: W, interactive: bool) -> Self {
        Self { out, interactive }
    }

    pub fn draw(&mut self, frame: &str) -> anyhow::Result<()> {
        if !self.interactive {
            writeln!(self.out, "{frame}").context("failed to write frame")?;
            return self.out.flush().context("failed to flush frame");
        }

        self.out
            .queue(Clear(ClearType::All))
            .context("failed to clear terminal screen")?;
        for (index, line) in frame.lines().enumerate() {
            let Ok(row) = u16::try_from(index) else {
                break;
            };
            self.out
                .queue(MoveTo(0, row))
                .context("failed to move cursor during frame render")?;
            self.out
                .queue(Print(line))
                .context("failed to print frame line")?;
        }
        self.out.flush().context("failed to flush terminal frame")
    }
}

impl<W: Write> Drop for Screen<W> {
    fn drop(&mut self) {
        if !self.interactive {
            return;
        }
        let _ = self.out.execute(Show);
        let _ = self.out.execute(LeaveAlternateScreen);
        let _ = self.out.flush();
    }
}

/// Redraw every live book at a fixed period until cancelled.
pub async fn run_renderer(
    books: BookHandle,
    mut screen: Screen<Stdout>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let frame: String = books
                    .snapshots()
                    .iter()
                    .map(|snapshot| render_book(snapshot) + "\n")
                    .collect();
                if let Err(e) = screen.draw(&frame) {
                    tracing::error!(error = %e, "terminal rendering failed, renderer stopped");
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
