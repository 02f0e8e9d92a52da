//! # Rate-Controlled Transmit Path
//!
//! Earliest-departure-time pacing on wire size. Each frame is charged
//! `frame + FCS + preamble + IFG` bytes, so the configured Mbit/s is the
//! line rate for any frame length. The schedule runs in picoseconds to keep
//! sub-nanosecond gaps (10 GbE at 60 B is 67.2 ns per frame) from
//! accumulating rounding error.
//!
//! The departure clock never lags `now` by more than the burst allowance:
//! an idle or stalled sender may catch up with a short burst but cannot
//! bank credit.

use std::time::Duration;

use crate::clock::{wait_until, TimeSource};
use crate::device::{DeviceError, TxQueue};
use crate::frame::wire_len;
use crate::pool::PacketBuffer;

/// Default catch-up allowance.
pub const DEFAULT_BURST: Duration = Duration::from_micros(50);

/// Picoseconds on the wire per byte at 1 Mbit/s.
const PS_PER_BYTE_AT_1MBIT: u64 = 8_000_000;

// ─── Pacer ───────────────────────────────────────────────────────────────────

/// Departure-time scheduler for one queue.
#[derive(Debug, Clone)]
pub struct Pacer {
    mbit: u32,
    next_ps: Option<u64>,
    burst_ps: u64,
}

impl Pacer {
    pub fn new(mbit: u32) -> Result<Self, DeviceError> {
        Self::with_burst(mbit, DEFAULT_BURST)
    }

    pub fn with_burst(mbit: u32, burst: Duration) -> Result<Self, DeviceError> {
        if mbit == 0 {
            return Err(DeviceError::InvalidRate(mbit));
        }
        Ok(Pacer {
            mbit,
            next_ps: None,
            burst_ps: burst.as_nanos() as u64 * 1000,
        })
    }

    pub fn rate_mbit(&self) -> u32 {
        self.mbit
    }

    /// Wire time of one frame, in picoseconds.
    #[inline]
    pub fn cost_ps(&self, frame_len: usize) -> u64 {
        wire_len(frame_len) as u64 * PS_PER_BYTE_AT_1MBIT / self.mbit as u64
    }

    /// Reserve a departure slot for a `frame_len`-byte frame.
    /// Returns the departure time in nanoseconds.
    #[inline]
    pub fn schedule(&mut self, now_ns: u64, frame_len: usize) -> u64 {
        let now_ps = now_ns.saturating_mul(1000);
        let floor = now_ps.saturating_sub(self.burst_ps);
        let depart = match self.next_ps {
            Some(next) => next.max(floor),
            None => now_ps,
        };
        self.next_ps = Some(depart + self.cost_ps(frame_len));
        depart / 1000
    }

    /// Give back the slot of a frame the device did not accept.
    pub fn refund(&mut self, frame_len: usize) {
        let cost = self.cost_ps(frame_len);
        if let Some(next) = self.next_ps.as_mut() {
            *next = next.saturating_sub(cost);
        }
    }
}

// ─── RateLimitedTx ───────────────────────────────────────────────────────────

/// Transmit queue wrapper that enforces a [`Pacer`].
///
/// Without a rate it is a pass-through. The rate can be set once, before
/// the first frame is sent.
pub struct RateLimitedTx<Q, C> {
    inner: Q,
    clock: C,
    pacer: Option<Pacer>,
    burst: Duration,
    started: bool,
}

impl<Q: TxQueue, C: TimeSource> RateLimitedTx<Q, C> {
    pub fn new(inner: Q, clock: C) -> Self {
        RateLimitedTx {
            inner,
            clock,
            pacer: None,
            burst: DEFAULT_BURST,
            started: false,
        }
    }

    pub fn with_burst(mut self, burst: Duration) -> Self {
        self.burst = burst;
        self
    }

    /// Fix the transmit rate in Mbit/s.
    pub fn set_rate(&mut self, mbit: u32) -> Result<(), DeviceError> {
        if self.started || self.pacer.is_some() {
            return Err(DeviceError::RateLocked);
        }
        self.pacer = Some(Pacer::with_burst(mbit, self.burst)?);
        tracing::info!(rate_mbit = mbit, burst_us = self.burst.as_micros() as u64, "tx rate set");
        Ok(())
    }

    pub fn rate_mbit(&self) -> Option<u32> {
        self.pacer.as_ref().map(Pacer::rate_mbit)
    }

    pub fn into_inner(self) -> Q {
        self.inner
    }
}

/// Send `chunk` and refund the slots of frames the queue turned away.
fn flush<Q: TxQueue>(
    inner: &mut Q,
    pacer: &mut Pacer,
    chunk: &[PacketBuffer],
) -> Result<usize, DeviceError> {
    if chunk.is_empty() {
        return Ok(0);
    }
    let accepted = match inner.send(chunk) {
        Ok(n) => n.min(chunk.len()),
        Err(e) => {
            for frame in chunk {
                pacer.refund(frame.len());
            }
            return Err(e);
        }
    };
    for frame in &chunk[accepted..] {
        pacer.refund(frame.len());
    }
    Ok(accepted)
}

impl<Q: TxQueue, C: TimeSource> TxQueue for RateLimitedTx<Q, C> {
    fn send(&mut self, frames: &[PacketBuffer]) -> Result<usize, DeviceError> {
        self.started = true;
        let Some(pacer) = self.pacer.as_mut() else {
            return self.inner.send(frames);
        };

        // Frames already due go out together; the first frame that is not
        // yet due closes the chunk.
        let mut now = self.clock.now_ns();
        let mut chunk_start = 0;
        let mut sent = 0;
        for (i, frame) in frames.iter().enumerate() {
            let depart = pacer.schedule(now, frame.len());
            if depart <= now {
                continue;
            }
            let chunk = &frames[chunk_start..i];
            let n = match flush(&mut self.inner, pacer, chunk) {
                Ok(n) => n,
                Err(e) => {
                    pacer.refund(frame.len());
                    return Err(e);
                }
            };
            sent += n;
            if n < chunk.len() {
                // Queue full; this frame was never offered.
                pacer.refund(frame.len());
                return Ok(sent);
            }
            wait_until(&self.clock, depart);
            now = depart.max(self.clock.now_ns());
            chunk_start = i;
        }
        Ok(sent + flush(&mut self.inner, pacer, &frames[chunk_start..])?)
    }

    fn tx_timestamp(&mut self) -> Option<u64> {
        self.inner.tx_timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::StepClock;
    use crate::frame::{FrameTemplate, MacAddr};
    use crate::pool::BufferPool;
    use std::sync::Arc;

    /// Records the wire bytes it accepts and the clock at each send.
    struct CountingTx {
        clock: Arc<StepClock>,
        frames: u64,
        wire_bytes: u64,
        first_ns: Option<u64>,
        last_ns: u64,
        limit: Option<usize>,
        fail: bool,
    }

    impl CountingTx {
        fn new(clock: Arc<StepClock>) -> Self {
            CountingTx {
                clock,
                frames: 0,
                wire_bytes: 0,
                first_ns: None,
                last_ns: 0,
                limit: None,
                fail: false,
            }
        }
    }

    impl TxQueue for CountingTx {
        fn send(&mut self, frames: &[PacketBuffer]) -> Result<usize, DeviceError> {
            if self.fail {
                return Err(DeviceError::Io(std::io::Error::other("link gone")));
            }
            let n = self.limit.map_or(frames.len(), |l| l.min(frames.len()));
            let now = self.clock.peek_ns();
            self.first_ns.get_or_insert(now);
            self.last_ns = now;
            self.frames += n as u64;
            self.wire_bytes += frames[..n].iter().map(|f| wire_len(f.len()) as u64).sum::<u64>();
            Ok(n)
        }
    }

    fn batch(frame_len: usize, n: usize) -> Vec<PacketBuffer> {
        let template = FrameTemplate::builder(MacAddr::ZERO, MacAddr::BROADCAST).build();
        let mut pool = BufferPool::new(template, n, 2048);
        let mut out = Vec::new();
        pool.alloc(&mut out, n, frame_len);
        out
    }

    fn measured_mbit(frame_len: usize, rate: u32, total: usize) -> f64 {
        let clock = Arc::new(StepClock::new(20));
        let mut tx = RateLimitedTx::new(CountingTx::new(clock.clone()), clock.clone());
        tx.set_rate(rate).unwrap();
        let frames = batch(frame_len, 63);
        let mut sent = 0;
        while sent < total {
            sent += tx.send(&frames).unwrap();
        }
        let inner = tx.into_inner();
        let elapsed_ns = inner.last_ns - inner.first_ns.unwrap();
        // Exclude the last frame's own wire time from the numerator.
        let bytes = inner.wire_bytes - wire_len(frame_len) as u64;
        bytes as f64 * 8.0 * 1000.0 / elapsed_ns as f64
    }

    #[test]
    fn schedule_spaces_by_wire_time() {
        let mut pacer = Pacer::new(1000).unwrap();
        // 60 B + 24 B overhead = 84 B = 672 ns at 1 Gbit/s.
        assert_eq!(pacer.schedule(1_000, 60), 1_000);
        assert_eq!(pacer.schedule(1_000, 60), 1_672);
        assert_eq!(pacer.schedule(1_000, 60), 2_344);
    }

    #[test]
    fn sub_nanosecond_gaps_do_not_drift() {
        let mut pacer = Pacer::new(10_000).unwrap();
        let mut last = 0;
        for _ in 0..1_000_000 {
            last = pacer.schedule(0, 60);
        }
        // 999_999 gaps of 67.2 ns.
        assert_eq!(last, 67_199_932);
    }

    #[test]
    fn idle_sender_cannot_bank_credit() {
        let mut pacer = Pacer::with_burst(1000, Duration::from_micros(10)).unwrap();
        pacer.schedule(0, 60);
        // One second idle: the schedule snaps to now - burst.
        let depart = pacer.schedule(1_000_000_000, 60);
        assert_eq!(depart, 1_000_000_000 - 10_000);
    }

    #[test]
    fn refund_returns_slot() {
        let mut pacer = Pacer::new(1000).unwrap();
        pacer.schedule(0, 60);
        pacer.schedule(0, 60);
        pacer.refund(60);
        assert_eq!(pacer.schedule(0, 60), 672);
    }

    #[test]
    fn zero_rate_rejected() {
        assert!(matches!(Pacer::new(0), Err(DeviceError::InvalidRate(0))));
        let clock = Arc::new(StepClock::new(1));
        let mut tx = RateLimitedTx::new(CountingTx::new(clock.clone()), clock);
        assert!(matches!(tx.set_rate(0), Err(DeviceError::InvalidRate(0))));
    }

    #[test]
    fn rate_is_locked_after_first_send() {
        let clock = Arc::new(StepClock::new(1));
        let mut tx = RateLimitedTx::new(CountingTx::new(clock.clone()), clock.clone());
        tx.send(&batch(60, 1)).unwrap();
        assert!(matches!(tx.set_rate(1000), Err(DeviceError::RateLocked)));

        let mut tx = RateLimitedTx::new(CountingTx::new(clock.clone()), clock);
        tx.set_rate(1000).unwrap();
        assert!(matches!(tx.set_rate(2000), Err(DeviceError::RateLocked)));
        assert_eq!(tx.rate_mbit(), Some(1000));
    }

    #[test]
    fn converges_for_minimum_frames() {
        let mbit = measured_mbit(60, 1000, 50_000);
        assert!((mbit - 1000.0).abs() < 10.0, "measured {mbit} Mbit/s");
    }

    #[test]
    fn converges_for_full_size_frames() {
        let mbit = measured_mbit(1514, 1000, 5_000);
        assert!((mbit - 1000.0).abs() < 10.0, "measured {mbit} Mbit/s");
    }

    #[test]
    fn rejected_frames_are_not_charged() {
        // Coarse clock: several frames are due at every read.
        let clock = Arc::new(StepClock::new(5_000));
        let mut inner = CountingTx::new(clock.clone());
        inner.limit = Some(1);
        let mut tx = RateLimitedTx::new(inner, clock);
        tx.set_rate(1000).unwrap();

        let sent = tx.send(&batch(60, 8)).unwrap();
        assert_eq!(sent, 2);
        // Only the two accepted frames hold slots.
        assert_eq!(tx.pacer.as_ref().unwrap().next_ps, Some(2 * 672_000));
        assert_eq!(tx.into_inner().frames, 2);
    }

    #[test]
    fn device_error_releases_whole_chunk() {
        let clock = Arc::new(StepClock::new(5_000));
        let mut inner = CountingTx::new(clock.clone());
        inner.fail = true;
        let mut tx = RateLimitedTx::new(inner, clock);
        tx.set_rate(1000).unwrap();

        assert!(matches!(tx.send(&batch(60, 8)), Err(DeviceError::Io(_))));
        // Neither the failed chunk nor the frame that closed it holds a slot.
        assert_eq!(tx.pacer.as_ref().unwrap().next_ps, Some(0));
    }
}
