//! # Throughput Statistics
//!
//! Periodic sampling of device counters. The reporter thread logs per-interval
//! packet and wire rates and, on shutdown, the mean and standard deviation of
//! those rates alongside the raw totals. All snapshots serialize to JSON.

use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::RunToken;
use crate::frame::WIRE_OVERHEAD;

// ─── Counters ────────────────────────────────────────────────────────────────

/// Cumulative device counters. Byte counts exclude the FCS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCounters {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
}

impl DeviceCounters {
    /// Counter growth since `earlier`. Counter resets yield zero.
    pub fn delta(&self, earlier: &DeviceCounters) -> DeviceCounters {
        DeviceCounters {
            tx_packets: self.tx_packets.saturating_sub(earlier.tx_packets),
            tx_bytes: self.tx_bytes.saturating_sub(earlier.tx_bytes),
            rx_packets: self.rx_packets.saturating_sub(earlier.rx_packets),
            rx_bytes: self.rx_bytes.saturating_sub(earlier.rx_bytes),
            rx_dropped: self.rx_dropped.saturating_sub(earlier.rx_dropped),
        }
    }
}

/// Something that can report [`DeviceCounters`].
pub trait CounterSource: Send {
    /// Label used in log lines.
    fn name(&self) -> &str;

    fn read(&self) -> std::io::Result<DeviceCounters>;
}

// ─── Rates ───────────────────────────────────────────────────────────────────

/// Packet and wire rate over one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub mpps: f64,
    /// Wire rate including FCS, preamble and inter-frame gap.
    pub mbit: f64,
}

impl Throughput {
    pub fn from_delta(packets: u64, bytes: u64, interval: Duration) -> Self {
        let secs = interval.as_secs_f64();
        if secs <= 0.0 {
            return Throughput::default();
        }
        let wire_bytes = bytes + packets * WIRE_OVERHEAD as u64;
        Throughput {
            mpps: packets as f64 / secs / 1e6,
            mbit: wire_bytes as f64 * 8.0 / secs / 1e6,
        }
    }
}

/// Running mean / standard deviation (Welford).
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateSummary {
    pub samples: u64,
    pub mean: f64,
    pub stddev: f64,
    #[serde(skip)]
    m2: f64,
}

impl RateSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value: f64) {
        self.samples += 1;
        let delta = value - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (value - self.mean);
        self.stddev = if self.samples > 1 {
            (self.m2 / (self.samples - 1) as f64).sqrt()
        } else {
            0.0
        };
    }
}

/// End-of-run summary for one device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSummary {
    pub device: String,
    pub tx_mpps: RateSummary,
    pub tx_mbit: RateSummary,
    pub rx_mpps: RateSummary,
    pub rx_mbit: RateSummary,
    pub totals: DeviceCounters,
}

// ─── Reporter ────────────────────────────────────────────────────────────────

struct Tracked {
    source: Box<dyn CounterSource>,
    baseline: DeviceCounters,
    last: DeviceCounters,
    summary: StatsSummary,
}

impl Tracked {
    fn new(source: Box<dyn CounterSource>) -> Self {
        let baseline = source.read().unwrap_or_else(|e| {
            tracing::warn!(device = source.name(), error = %e, "initial counter read failed");
            DeviceCounters::default()
        });
        let summary = StatsSummary {
            device: source.name().to_string(),
            ..StatsSummary::default()
        };
        Tracked {
            source,
            baseline,
            last: baseline,
            summary,
        }
    }

    fn sample(&mut self, interval: Duration) {
        let now = match self.source.read() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(device = self.source.name(), error = %e, "counter read failed");
                return;
            }
        };
        let d = now.delta(&self.last);
        self.last = now;

        let tx = Throughput::from_delta(d.tx_packets, d.tx_bytes, interval);
        let rx = Throughput::from_delta(d.rx_packets, d.rx_bytes, interval);
        self.summary.tx_mpps.record(tx.mpps);
        self.summary.tx_mbit.record(tx.mbit);
        self.summary.rx_mpps.record(rx.mpps);
        self.summary.rx_mbit.record(rx.mbit);

        tracing::info!(
            device = self.source.name(),
            tx_mpps = format_args!("{:.2}", tx.mpps),
            tx_mbit = format_args!("{:.0}", tx.mbit),
            rx_mpps = format_args!("{:.2}", rx.mpps),
            rx_mbit = format_args!("{:.0}", rx.mbit),
            rx_dropped = d.rx_dropped,
            "throughput"
        );
    }

    fn finish(mut self) -> StatsSummary {
        if let Ok(c) = self.source.read() {
            self.last = c;
        }
        self.summary.totals = self.last.delta(&self.baseline);
        let s = &self.summary;
        tracing::info!(
            device = %s.device,
            tx_mpps = format_args!("{:.2} (stddev {:.2})", s.tx_mpps.mean, s.tx_mpps.stddev),
            tx_mbit = format_args!("{:.0} (stddev {:.0})", s.tx_mbit.mean, s.tx_mbit.stddev),
            rx_mpps = format_args!("{:.2} (stddev {:.2})", s.rx_mpps.mean, s.rx_mpps.stddev),
            tx_packets = s.totals.tx_packets,
            rx_packets = s.totals.rx_packets,
            "throughput summary"
        );
        self.summary
    }
}

/// Spawn the stats reporter. Samples every `interval` until `token` is
/// cancelled, then returns one summary per source.
pub fn start_stats_task(
    sources: Vec<Box<dyn CounterSource>>,
    interval: Duration,
    token: RunToken,
) -> thread::JoinHandle<Vec<StatsSummary>> {
    thread::Builder::new()
        .name("latgen-stats".into())
        .spawn(move || {
            let mut tracked: Vec<Tracked> = sources.into_iter().map(Tracked::new).collect();
            let mut last_tick = Instant::now();
            while token.sleep(interval) {
                let elapsed = last_tick.elapsed();
                last_tick = Instant::now();
                for t in &mut tracked {
                    t.sample(elapsed);
                }
            }
            tracked.into_iter().map(Tracked::finish).collect()
        })
        .expect("failed to spawn stats reporter")
}
