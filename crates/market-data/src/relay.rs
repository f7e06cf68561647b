//! UDP relay of published book snapshots.
//!
//! Every snapshot received from the engine's broadcast is packed into one
//! little-endian datagram and sent to a fixed address:
//!
//! ```text
//! i32  id
//! u16  pair length, then the pair bytes (BASE:QUOTE)
//! u16  depth N
//! N x (f32 price, f32 qty)  bids, best first
//! N x (f32 price, f32 qty)  asks, best first
//! f32  low, high, last, volume, bid, ask
//! ```
//!
//! Empty slots keep their sentinel price and zero quantity.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use cx_core::types::{BookSnapshot, Level};

/// Size of one encoded datagram.
pub fn encoded_len(snapshot: &BookSnapshot) -> usize {
    4 + 2 + snapshot.pair.as_str().len() + 2 + 8 * (snapshot.bids.len() + snapshot.asks.len()) + 6 * 4
}

/// Append the datagram for `snapshot` to `buf`.
pub fn encode_snapshot(snapshot: &BookSnapshot, buf: &mut BytesMut) {
    let pair = snapshot.pair.as_str().as_bytes();
    buf.reserve(encoded_len(snapshot));
    // Ids fit in 32 bits for the lifetime of a subscription.
    buf.put_i32_le(snapshot.id as i32);
    buf.put_u16_le(pair.len() as u16);
    buf.put_slice(pair);
    buf.put_u16_le(snapshot.depth() as u16);
    put_levels(buf, &snapshot.bids);
    put_levels(buf, &snapshot.asks);

    let t = &snapshot.ticker;
    for v in [t.low, t.high, t.last, t.volume, t.bid, t.ask] {
        buf.put_f32_le(v);
    }
}

fn put_levels(buf: &mut BytesMut, levels: &[Level]) {
    for level in levels {
        buf.put_f32_le(level.price);
        buf.put_f32_le(level.qty);
    }
}

pub struct Relay {
    socket: UdpSocket,
    target: SocketAddr,
}

impl Relay {
    /// Bind an ephemeral local port and target `publish_addr`.
    pub async fn bind(publish_addr: &str) -> Result<Self> {
        let target: SocketAddr = publish_addr
            .parse()
            .with_context(|| format!("invalid relay address {publish_addr:?}"))?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .context("failed to bind relay socket")?;
        tracing::info!(target = %target, "snapshot relay ready");
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Forward snapshots until cancelled or the broadcast closes. A lagging
    /// relay skips the snapshots it missed.
    pub async fn run(self, mut snapshots: broadcast::Receiver<BookSnapshot>, cancel: CancellationToken) {
        let mut buf = BytesMut::with_capacity(512);
        let mut sent: u64 = 0;
        loop {
            let snapshot = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = snapshots.recv() => match r {
                    Ok(s) => s,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "relay lagging, snapshots skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            buf.clear();
            encode_snapshot(&snapshot, &mut buf);
            match self.socket.send_to(&buf, self.target).await {
                Ok(_) => sent += 1,
                Err(e) => tracing::warn!(error = %e, pair = %snapshot.pair, "relay send failed"),
            }
        }
        tracing::info!(sent, "snapshot relay stopped");
    }
}
