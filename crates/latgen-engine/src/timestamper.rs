//! # Timestamper
//!
//! Round-trip latency probing on the probe queue pair. One probe is in
//! flight at a time:
//!
//! ```text
//! IDLE ──send──▶ PROBE_SENT ──match──▶ COMPLETED ──▶ IDLE
//!                     │
//!                     └──max_wait──▶ TIMED_OUT ──▶ IDLE
//! ```
//!
//! Probes carry the marker from [`crate::frame::write_probe_marker`] and are
//! matched on it, not on addresses. Timestamps come from the device when
//! both the transmit and the receive side report one; otherwise both come
//! from the software clock.

use serde::Serialize;
use std::time::Duration;

use crate::cancel::RunToken;
use crate::clock::TimeSource;
use crate::device::{DeviceError, RxFrame, RxQueue, TxQueue};
use crate::frame::{
    read_probe_marker, write_probe_marker, FrameTemplate, MacAddr, MIN_FRAME_LEN, PROBE_DST_MAC,
};
use crate::histogram::Histogram;
use crate::pool::{BufferPool, PacketBuffer, DEFAULT_BUF_SIZE};

/// Frames pulled from the probe queue per poll.
const RX_BURST: usize = 32;

#[derive(Debug, Clone)]
pub struct TimestamperConfig {
    /// Probe frame length without FCS.
    pub probe_len: usize,
    /// How long to wait for a probe to come back.
    pub max_wait: Duration,
    /// Round trips above this are treated as measurement artifacts.
    pub max_latency: Duration,
    /// Delay before the first probe, letting the load reach steady state.
    pub warmup: Duration,
    /// Pause between probes.
    pub interval: Duration,
    pub probe_dst: MacAddr,
}

impl Default for TimestamperConfig {
    fn default() -> Self {
        TimestamperConfig {
            probe_len: MIN_FRAME_LEN,
            max_wait: Duration::from_millis(15),
            max_latency: Duration::from_secs(1),
            warmup: Duration::from_secs(1),
            interval: Duration::ZERO,
            probe_dst: PROBE_DST_MAC,
        }
    }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Receive timestamp precedes the send timestamp.
    Negative,
    /// Round trip above `max_latency`; carries the measured value.
    TooLarge(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Completed { latency_ns: u64 },
    TimedOut,
    Discarded(Discard),
    /// The probe queue did not accept the frame.
    NotSent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeStats {
    pub sent: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub discarded: u64,
    pub send_failed: u64,
    /// Frames on the probe queue that were not the awaited probe.
    pub foreign_frames: u64,
    /// Probes measured with device timestamps.
    pub hw_timestamped: u64,
}

// ─── Timestamper ─────────────────────────────────────────────────────────────

pub struct Timestamper<T, R, C> {
    tx: T,
    rx: R,
    clock: C,
    pool: BufferPool,
    probe: Vec<PacketBuffer>,
    rx_buf: Vec<RxFrame>,
    cfg: TimestamperConfig,
    sequence: u32,
    stats: ProbeStats,
}

impl<T: TxQueue, R: RxQueue, C: TimeSource> Timestamper<T, R, C> {
    /// `src` is the sending port's MAC.
    pub fn new(tx: T, rx: R, clock: C, src: MacAddr, cfg: TimestamperConfig) -> Self {
        let template = FrameTemplate::probe(src, cfg.probe_dst);
        Timestamper {
            tx,
            rx,
            clock,
            pool: BufferPool::new(template, 1, cfg.probe_len.max(DEFAULT_BUF_SIZE)),
            probe: Vec::with_capacity(1),
            rx_buf: Vec::with_capacity(RX_BURST),
            cfg,
            sequence: 0,
            stats: ProbeStats::default(),
        }
    }

    pub fn stats(&self) -> ProbeStats {
        self.stats
    }

    /// Send one probe and wait for it. Timeouts and implausible values are
    /// outcomes, not errors.
    pub fn measure_latency(&mut self) -> Result<ProbeOutcome, DeviceError> {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        if self.pool.alloc(&mut self.probe, 1, self.cfg.probe_len) == 0 {
            self.stats.send_failed += 1;
            return Ok(ProbeOutcome::NotSent);
        }
        write_probe_marker(self.probe[0].as_mut_slice(), seq);

        let sw_tx = self.clock.now_ns();
        let sent = self.tx.send(&self.probe);
        self.pool.free(&mut self.probe);
        if sent? == 0 {
            self.stats.send_failed += 1;
            return Ok(ProbeOutcome::NotSent);
        }
        self.stats.sent += 1;
        let hw_tx = self.tx.tx_timestamp();

        let deadline = sw_tx.saturating_add(self.cfg.max_wait.as_nanos() as u64);
        loop {
            let now = self.clock.now_ns();
            if now >= deadline {
                self.stats.timed_out += 1;
                tracing::debug!(seq, "probe timed out");
                return Ok(ProbeOutcome::TimedOut);
            }

            self.rx_buf.clear();
            self.rx
                .recv(&mut self.rx_buf, RX_BURST, Duration::from_nanos(deadline - now))?;
            let sw_rx = self.clock.now_ns();

            let mut matched = None;
            for frame in self.rx_buf.drain(..) {
                if matched.is_none() && read_probe_marker(&frame.data) == Some(seq) {
                    matched = Some(frame.timestamp_ns);
                } else {
                    self.stats.foreign_frames += 1;
                }
            }
            let Some(hw_rx) = matched else { continue };

            let (t_tx, t_rx) = match (hw_tx, hw_rx) {
                (Some(t), Some(r)) => {
                    self.stats.hw_timestamped += 1;
                    (t, r)
                }
                _ => (sw_tx, sw_rx),
            };
            return Ok(self.classify(seq, t_tx, t_rx));
        }
    }

    fn classify(&mut self, seq: u32, t_tx: u64, t_rx: u64) -> ProbeOutcome {
        let Some(elapsed) = t_rx.checked_sub(t_tx) else {
            self.stats.discarded += 1;
            tracing::debug!(seq, t_tx, t_rx, "negative latency discarded");
            return ProbeOutcome::Discarded(Discard::Negative);
        };
        if elapsed > self.cfg.max_latency.as_nanos() as u64 {
            self.stats.discarded += 1;
            tracing::debug!(seq, latency_ns = elapsed, "implausible latency discarded");
            return ProbeOutcome::Discarded(Discard::TooLarge(elapsed));
        }
        self.stats.completed += 1;
        ProbeOutcome::Completed { latency_ns: elapsed }
    }

    /// Probe until `token` is cancelled, feeding completed round trips into
    /// `hist`.
    pub fn run(&mut self, hist: &mut Histogram, token: &RunToken) -> Result<ProbeStats, DeviceError> {
        if !self.cfg.warmup.is_zero() {
            tracing::info!(warmup_ms = self.cfg.warmup.as_millis() as u64, "timestamper warming up");
            if !token.sleep(self.cfg.warmup) {
                return Ok(self.stats);
            }
        }
        tracing::info!(
            probe_len = self.cfg.probe_len,
            max_wait_ms = self.cfg.max_wait.as_millis() as u64,
            probe_dst = %self.cfg.probe_dst,
            "timestamper started"
        );

        while token.is_running() {
            if let ProbeOutcome::Completed { latency_ns } = self.measure_latency()? {
                hist.update(latency_ns);
            }
            if !self.cfg.interval.is_zero() && !token.sleep(self.cfg.interval) {
                break;
            }
        }

        let s = &self.stats;
        tracing::info!(
            sent = s.sent,
            completed = s.completed,
            timed_out = s.timed_out,
            discarded = s.discarded,
            foreign = s.foreign_frames,
            "timestamper stopped"
        );
        Ok(self.stats)
    }
}
