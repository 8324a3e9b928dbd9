use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Rolling window of `(timestamp, byte_count)` samples used to report a KB/s rate.
///
/// Advisory telemetry only: correctness of forwarding never depends on this meter,
/// so its lock is never held across a network I/O call.
pub struct BandwidthMeter {
    window_len: Duration,
    inner: Mutex<Window>,
}

struct Window {
    samples: VecDeque<(Instant, u64)>,
    bytes_in_window: u64,
}

impl BandwidthMeter {
    pub fn new(window_len_secs: u64) -> Self {
        BandwidthMeter {
            window_len: Duration::from_secs(window_len_secs.max(1)),
            inner: Mutex::new(Window {
                samples: VecDeque::new(),
                bytes_in_window: 0,
            }),
        }
    }

    /// Records `n` bytes forwarded just now and evicts samples older than `window_len`.
    pub async fn record(&self, n: u64) {
        if n == 0 {
            return;
        }
        let now = Instant::now();
        let mut window = self.inner.lock().await;
        window.samples.push_back((now, n));
        window.bytes_in_window += n;
        self.evict_stale(&mut window, now);
    }

    /// Current rate in kilobytes/second over the configured window.
    pub async fn rate_kbps(&self) -> f64 {
        let mut window = self.inner.lock().await;
        self.evict_stale(&mut window, Instant::now());
        (window.bytes_in_window as f64) / self.window_len.as_secs_f64() / 1024.0
    }

    fn evict_stale(&self, window: &mut Window, now: Instant) {
        while let Some(&(t, n)) = window.samples.front() {
            if now.duration_since(t) > self.window_len {
                window.samples.pop_front();
                window.bytes_in_window -= n;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accumulates_within_window() {
        let meter = BandwidthMeter::new(3);
        meter.record(1024).await;
        meter.record(1024).await;
        let rate = meter.rate_kbps().await;
        assert!((rate - (2048.0 / 3.0 / 1024.0)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_drops_stale_samples_to_zero() {
        let meter = BandwidthMeter::new(3);
        meter.record(4096).await;
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(meter.rate_kbps().await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_eviction_keeps_fresh_samples() {
        let meter = BandwidthMeter::new(3);
        meter.record(1024).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        meter.record(2048).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        // first sample (now 4s old) evicted, second (2s old) remains
        let rate = meter.rate_kbps().await;
        assert!((rate - (2048.0 / 3.0 / 1024.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_length_record_is_a_no_op() {
        let meter = BandwidthMeter::new(3);
        meter.record(0).await;
        assert_eq!(meter.rate_kbps().await, 0.0);
    }
}
