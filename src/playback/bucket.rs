//! Flow control for playback byte streams.
//!
//! A leaky bucket releases transcoder output at the stream's nominal bitrate
//! so a fast transcoder cannot flood a slow client. The release rate only
//! ever rises under backlog pressure; it never drops below nominal, so a
//! stream that fell behind catches up instead of stalling.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Drain tick for [`pump`].
pub const TICK: Duration = Duration::from_millis(50);

/// Backlog beyond this many seconds of nominal-rate data doubles the release
/// rate until the backlog clears.
const PRESSURE_SECS: u64 = 3;

/// Byte-rate limiter state. Pure data, driven by [`pump`] or by tests
/// directly.
pub struct LeakyBucket {
    bytes_per_sec: u64,
    backlog: VecDeque<Bytes>,
    backlog_bytes: usize,
}

impl LeakyBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            backlog: VecDeque::new(),
            backlog_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.backlog_bytes += chunk.len();
        self.backlog.push_back(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    pub fn backlog_bytes(&self) -> usize {
        self.backlog_bytes
    }

    /// Release up to `elapsed` worth of bytes at the current rate, splitting
    /// chunks at the budget boundary.
    pub fn take(&mut self, elapsed: Duration) -> Vec<Bytes> {
        let rate = if self.backlog_bytes as u64 > self.bytes_per_sec * PRESSURE_SECS {
            trace!(backlog = self.backlog_bytes, "backlog pressure, draining at 2x");
            self.bytes_per_sec * 2
        } else {
            self.bytes_per_sec
        };
        let mut budget = (rate as f64 * elapsed.as_secs_f64()) as usize;

        let mut out = Vec::new();
        while budget > 0 {
            let Some(mut chunk) = self.backlog.pop_front() else {
                break;
            };
            if chunk.len() <= budget {
                budget -= chunk.len();
                self.backlog_bytes -= chunk.len();
                out.push(chunk);
            } else {
                let head = chunk.split_to(budget);
                self.backlog_bytes -= budget;
                budget = 0;
                self.backlog.push_front(chunk);
                out.push(head);
            }
        }
        out
    }

    /// Drain everything immediately (end of input).
    pub fn flush(&mut self) -> Vec<Bytes> {
        self.backlog_bytes = 0;
        self.backlog.drain(..).collect()
    }
}

/// Pump `input` to `output` at `bytes_per_sec`. Ends when the input closes
/// (remainder flushed) or the output side goes away.
pub async fn pump(
    mut input: mpsc::Receiver<Bytes>,
    output: mpsc::Sender<Bytes>,
    bytes_per_sec: u64,
) {
    let mut bucket = LeakyBucket::new(bytes_per_sec);
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            chunk = input.recv() => match chunk {
                Some(chunk) => bucket.push(chunk),
                None => {
                    for chunk in bucket.flush() {
                        if output.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
            },
            _ = ticker.tick() => {
                for chunk in bucket.take(TICK) {
                    if output.send(chunk).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_at_nominal_rate() {
        let mut bucket = LeakyBucket::new(1_000);
        bucket.push(Bytes::from(vec![0u8; 2_500]));

        let out = bucket.take(Duration::from_secs(1));
        let released: usize = out.iter().map(|b| b.len()).sum();
        assert_eq!(released, 1_000);
        assert_eq!(bucket.backlog_bytes(), 1_500);
    }

    #[test]
    fn splits_chunks_at_the_budget_boundary() {
        let mut bucket = LeakyBucket::new(1_000);
        bucket.push(Bytes::from_static(b"aaaa"));
        bucket.push(Bytes::from(vec![b'b'; 2_000]));

        let out = bucket.take(Duration::from_millis(100));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 4);
        assert_eq!(out[1].len(), 96);
        // the split remainder stays queued in order
        let rest = bucket.flush();
        assert_eq!(rest[0].len(), 2_000 - 96);
    }

    #[test]
    fn backlog_pressure_doubles_the_rate_until_cleared() {
        let mut bucket = LeakyBucket::new(1_000);
        // over 3 seconds worth queued
        bucket.push(Bytes::from(vec![0u8; 4_000]));

        let fast: usize = bucket.take(Duration::from_secs(1)).iter().map(|b| b.len()).sum();
        assert_eq!(fast, 2_000);

        // backlog now at 2s worth, back to nominal
        let normal: usize = bucket.take(Duration::from_secs(1)).iter().map(|b| b.len()).sum();
        assert_eq!(normal, 1_000);
    }

    #[test]
    fn take_on_empty_is_empty() {
        let mut bucket = LeakyBucket::new(1_000);
        assert!(bucket.take(Duration::from_secs(1)).is_empty());
        assert!(bucket.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_forwards_everything_in_order_and_ends() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let task = tokio::spawn(pump(in_rx, out_tx, 1_000));

        for chunk in [&b"first"[..], b"second", b"third"] {
            in_tx.send(Bytes::from_static(chunk)).await.unwrap();
        }
        drop(in_tx);

        let mut collected = Vec::new();
        while let Some(chunk) = out_rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"firstsecondthird");
        task.await.unwrap();
    }
}
