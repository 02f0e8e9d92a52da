//! # Benchmark Runner
//!
//! Wires one device into a load + latency run:
//!
//! 1. wait for link, take the data and probe queue pairs
//! 2. fix the data-queue rate
//! 3. start the stats reporter, the load loop and the timestamper (which
//!    warms up on its own)
//! 4. wait for the token, join everything
//! 5. print and save the histogram, once
//!
//! Each loop owns its queues outright. Either loop failing cancels the
//! token so the other winds down too.

use serde::Serialize;
use std::path::PathBuf;
use std::thread;
use thiserror::Error;

use crate::cancel::RunToken;
use crate::clock::TimeSource;
use crate::config::BenchConfig;
use crate::device::{Device, DeviceError, DATA_QUEUE, PROBE_QUEUE};
use crate::frame::FrameTemplate;
use crate::histogram::{Histogram, HistogramError, HistogramSummary};
use crate::loadgen::{LoadGenerator, LoadReport};
use crate::pacer::RateLimitedTx;
use crate::pool::{BufferPool, DEFAULT_BUF_SIZE};
use crate::stats::{start_stats_task, StatsSummary};
use crate::timestamper::{ProbeStats, Timestamper};

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Histogram(#[from] HistogramError),
    #[error("{0} thread panicked")]
    TaskPanicked(&'static str),
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub rate_mbit: u32,
    pub frame_size: usize,
    pub load: LoadReport,
    pub probes: ProbeStats,
    pub latency: HistogramSummary,
    pub throughput: Vec<StatsSummary>,
    pub histogram_file: PathBuf,
    #[serde(skip)]
    pub histogram: Histogram,
}

pub struct Benchmark<C> {
    cfg: BenchConfig,
    clock: C,
}

impl<C> Benchmark<C>
where
    C: TimeSource + Clone + 'static,
{
    pub fn new(cfg: BenchConfig, clock: C) -> Self {
        Benchmark { cfg, clock }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.cfg
    }

    /// Run against `dev` until `token` is cancelled (or the configured
    /// runtime elapses).
    pub fn run<D: Device>(&self, dev: &mut D, token: &RunToken) -> Result<BenchReport, BenchError> {
        let cfg = &self.cfg;
        dev.wait_for_links(cfg.link_timeout)?;

        let mac = dev.mac();
        let mut data_tx = RateLimitedTx::new(dev.tx_queue(DATA_QUEUE)?, self.clock.clone());
        data_tx.set_rate(cfg.rate_mbit)?;
        let probe_tx = dev.tx_queue(PROBE_QUEUE)?;
        let probe_rx = dev.rx_queue(PROBE_QUEUE)?;

        tracing::info!(
            src = %mac,
            dst = %cfg.dst,
            rate_mbit = cfg.rate_mbit,
            frame_size = cfg.frame_size,
            runtime_s = cfg.runtime.map(|d| d.as_secs()),
            "benchmark starting"
        );

        let stats = start_stats_task(vec![dev.counters()], cfg.stats_interval, token.clone());
        let timer = cfg.runtime.map(|rt| token.cancel_after(rt));

        let load = {
            let template = FrameTemplate::builder(mac, cfg.dst).build();
            let buf_size = cfg.frame_size.max(DEFAULT_BUF_SIZE);
            let pool = BufferPool::new(template, cfg.pool_size, buf_size);
            let mut generator = LoadGenerator::new(data_tx, pool, cfg.frame_size, cfg.batch_size);
            let token = token.clone();
            thread::Builder::new()
                .name("latgen-load".into())
                .spawn(move || {
                    let result = generator.run(&token);
                    if result.is_err() {
                        token.cancel();
                    }
                    result
                })
                .expect("failed to spawn load thread")
        };

        let probe = {
            let mut timestamper =
                Timestamper::new(probe_tx, probe_rx, self.clock.clone(), mac, cfg.probe.clone());
            let mut hist = Histogram::new(cfg.bucket_width_ns);
            let token = token.clone();
            thread::Builder::new()
                .name("latgen-timestamper".into())
                .spawn(move || {
                    let result = timestamper.run(&mut hist, &token);
                    if result.is_err() {
                        token.cancel();
                    }
                    (result, hist)
                })
                .expect("failed to spawn timestamper thread")
        };

        let load = load.join().map_err(|_| BenchError::TaskPanicked("load"));
        let probe = probe.join().map_err(|_| BenchError::TaskPanicked("timestamper"));
        // Both loops are done; make sure the helpers stop too.
        token.cancel();
        let throughput = stats.join().unwrap_or_default();
        if let Some(timer) = timer {
            let _ = timer.join();
        }

        let (probe_result, hist) = probe?;
        hist.print();
        let saved = hist.save(&cfg.histogram_file);

        let load = load??;
        let probes = probe_result?;
        saved?;

        Ok(BenchReport {
            rate_mbit: cfg.rate_mbit,
            frame_size: cfg.frame_size,
            load,
            probes,
            latency: hist.summary(),
            throughput,
            histogram_file: cfg.histogram_file.clone(),
            histogram: hist,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::QuantaClock;
    use crate::device::loopback::{LoopbackConfig, LoopbackDevice};
    use std::time::Duration;

    fn config(name: &str) -> BenchConfig {
        let mut cfg = BenchConfig {
            rate_mbit: 100,
            runtime: Some(Duration::from_millis(150)),
            stats_interval: Duration::from_millis(20),
            histogram_file: std::env::temp_dir()
                .join(format!("latgen-runner-{}-{name}.csv", std::process::id())),
            ..BenchConfig::default()
        };
        cfg.probe.warmup = Duration::from_millis(10);
        cfg.probe.max_wait = Duration::from_millis(2);
        cfg
    }

    #[test]
    fn echo_run_produces_samples_and_file() {
        let cfg = config("echo");
        let path = cfg.histogram_file.clone();
        let mut dev = LoopbackDevice::echo(LoopbackConfig::default());
        let report = Benchmark::new(cfg, QuantaClock::new())
            .run(&mut dev, &RunToken::new())
            .unwrap();

        assert!(report.load.frames_sent > 0);
        assert!(report.probes.completed > 0);
        assert_eq!(report.histogram.count(), report.probes.completed);
        assert_eq!(Histogram::load(&path).unwrap().count(), report.histogram.count());
        assert_eq!(report.throughput.len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn jumbo_frames_are_sent_at_full_size() {
        let mut cfg = config("jumbo");
        cfg.frame_size = 4000;
        cfg.probe.probe_len = 3000;
        cfg.validate().unwrap();
        let path = cfg.histogram_file.clone();
        let mut dev = LoopbackDevice::echo(LoopbackConfig::default());
        let report = Benchmark::new(cfg, QuantaClock::new())
            .run(&mut dev, &RunToken::new())
            .unwrap();

        assert!(report.load.frames_sent > 0);
        assert_eq!(report.load.bytes_sent, report.load.frames_sent * 4000);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn taken_queue_fails_before_start() {
        let mut dev = LoopbackDevice::echo(LoopbackConfig::default());
        let _stolen = dev.tx_queue(PROBE_QUEUE).unwrap();
        let err = Benchmark::new(config("stolen"), QuantaClock::new())
            .run(&mut dev, &RunToken::new())
            .unwrap_err();
        assert!(matches!(err, BenchError::Device(DeviceError::QueueTaken(1))));
    }

    #[test]
    fn zero_rate_is_rejected() {
        let mut cfg = config("zero");
        cfg.rate_mbit = 0;
        let mut dev = LoopbackDevice::echo(LoopbackConfig::default());
        let err = Benchmark::new(cfg, QuantaClock::new())
            .run(&mut dev, &RunToken::new())
            .unwrap_err();
        assert!(matches!(err, BenchError::Device(DeviceError::InvalidRate(0))));
    }
}
