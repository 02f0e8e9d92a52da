//! # Loopback Device
//!
//! In-memory [`Device`] whose queues are `rtrb` rings. Three wirings:
//!
//! - **echo**: every transmit queue feeds the receive queue with the same id,
//!   with source and destination MAC swapped, as if a reflector sat on the
//!   far end of the cable.
//! - **pair**: two devices connected back to back; `a.tx[i]` feeds `b.rx[i]`.
//! - **impaired**: either wiring with seeded probabilistic loss. A loss of
//!   1.0 is a blackhole.
//!
//! Receive counters are bumped when a frame reaches the ring, like a NIC
//! counting at the MAC; a full ring counts as `rx_dropped`.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{take_queue, Device, DeviceError, RxFrame, RxQueue, TxQueue};
use crate::frame::{swap_macs, MacAddr};
use crate::pool::PacketBuffer;
use crate::stats::{CounterSource, DeviceCounters};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Wire impairment applied to frames a device transmits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impairment {
    /// Drop probability in `[0, 1]`.
    pub loss: f64,
    pub seed: u64,
}

impl Impairment {
    pub const NONE: Impairment = Impairment { loss: 0.0, seed: 0 };

    pub fn loss(loss: f64, seed: u64) -> Self {
        Impairment {
            loss: loss.clamp(0.0, 1.0),
            seed,
        }
    }
}

impl Default for Impairment {
    fn default() -> Self {
        Self::NONE
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Queue pairs; the engine needs two (data and probe).
    pub queues: usize,
    /// Frames each ring holds before the receiver drops.
    pub ring_capacity: usize,
    pub mac: MacAddr,
    pub impairment: Impairment,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            queues: 2,
            ring_capacity: 4096,
            mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            impairment: Impairment::NONE,
        }
    }
}

// ─── Counters ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LoopbackCounters {
    name: String,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_dropped: AtomicU64,
}

impl LoopbackCounters {
    fn new(name: String) -> Self {
        LoopbackCounters {
            name,
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> DeviceCounters {
        DeviceCounters {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
        }
    }
}

struct SharedCounters(Arc<LoopbackCounters>);

impl CounterSource for SharedCounters {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn read(&self) -> std::io::Result<DeviceCounters> {
        Ok(self.0.snapshot())
    }
}

// ─── Queues ──────────────────────────────────────────────────────────────────

pub struct LoopbackTx {
    ring: rtrb::Producer<Bytes>,
    swap: bool,
    loss: f64,
    rng: StdRng,
    local: Arc<LoopbackCounters>,
    peer: Arc<LoopbackCounters>,
}

impl TxQueue for LoopbackTx {
    fn send(&mut self, frames: &[PacketBuffer]) -> Result<usize, DeviceError> {
        for frame in frames {
            self.local.tx_packets.fetch_add(1, Ordering::Relaxed);
            self.local
                .tx_bytes
                .fetch_add(frame.len() as u64, Ordering::Relaxed);

            if self.loss > 0.0 && self.rng.random::<f64>() < self.loss {
                continue;
            }

            let data = if self.swap {
                let mut copy = frame.as_slice().to_vec();
                swap_macs(&mut copy);
                Bytes::from(copy)
            } else {
                Bytes::copy_from_slice(frame.as_slice())
            };
            let len = data.len() as u64;
            match self.ring.push(data) {
                Ok(()) => {
                    self.peer.rx_packets.fetch_add(1, Ordering::Relaxed);
                    self.peer.rx_bytes.fetch_add(len, Ordering::Relaxed);
                }
                Err(_) => {
                    self.peer.rx_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        // The wire takes everything; loss happens downstream.
        Ok(frames.len())
    }
}

pub struct LoopbackRx {
    ring: rtrb::Consumer<Bytes>,
}

impl LoopbackRx {
    fn drain(&mut self, out: &mut Vec<RxFrame>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.ring.pop() {
                Ok(data) => {
                    out.push(RxFrame::new(data));
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }
}

impl RxQueue for LoopbackRx {
    fn recv(
        &mut self,
        out: &mut Vec<RxFrame>,
        max: usize,
        timeout: Duration,
    ) -> Result<usize, DeviceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let n = self.drain(out, max);
            if n > 0 || Instant::now() >= deadline {
                return Ok(n);
            }
            thread::yield_now();
        }
    }
}

// ─── Device ──────────────────────────────────────────────────────────────────

pub struct LoopbackDevice {
    mac: MacAddr,
    tx: Vec<Option<LoopbackTx>>,
    rx: Vec<Option<LoopbackRx>>,
    counters: Arc<LoopbackCounters>,
}

impl LoopbackDevice {
    /// Self-reflecting device: frames come back on the same queue id with
    /// their MACs swapped.
    pub fn echo(cfg: LoopbackConfig) -> Self {
        let counters = Arc::new(LoopbackCounters::new(format!("loop-{}", cfg.mac)));
        let mut tx = Vec::with_capacity(cfg.queues);
        let mut rx = Vec::with_capacity(cfg.queues);
        for q in 0..cfg.queues {
            let (producer, consumer) = rtrb::RingBuffer::new(cfg.ring_capacity);
            tx.push(Some(LoopbackTx {
                ring: producer,
                swap: true,
                loss: cfg.impairment.loss,
                rng: StdRng::seed_from_u64(cfg.impairment.seed.wrapping_add(q as u64)),
                local: counters.clone(),
                peer: counters.clone(),
            }));
            rx.push(Some(LoopbackRx { ring: consumer }));
        }
        LoopbackDevice {
            mac: cfg.mac,
            tx,
            rx,
            counters,
        }
    }

    /// Echo device that loses every frame.
    pub fn blackhole(cfg: LoopbackConfig) -> Self {
        Self::echo(LoopbackConfig {
            impairment: Impairment::loss(1.0, cfg.impairment.seed),
            ..cfg
        })
    }

    /// Two devices wired back to back. Both must have the same queue count.
    pub fn pair(a: LoopbackConfig, b: LoopbackConfig) -> (Self, Self) {
        let queues = a.queues.min(b.queues);
        let ca = Arc::new(LoopbackCounters::new(format!("loop-{}", a.mac)));
        let cb = Arc::new(LoopbackCounters::new(format!("loop-{}", b.mac)));

        let mut a_tx = Vec::with_capacity(queues);
        let mut a_rx = Vec::with_capacity(queues);
        let mut b_tx = Vec::with_capacity(queues);
        let mut b_rx = Vec::with_capacity(queues);
        for q in 0..queues {
            let (a_to_b, b_from_a) = rtrb::RingBuffer::new(b.ring_capacity);
            let (b_to_a, a_from_b) = rtrb::RingBuffer::new(a.ring_capacity);
            a_tx.push(Some(LoopbackTx {
                ring: a_to_b,
                swap: false,
                loss: a.impairment.loss,
                rng: StdRng::seed_from_u64(a.impairment.seed.wrapping_add(q as u64)),
                local: ca.clone(),
                peer: cb.clone(),
            }));
            b_tx.push(Some(LoopbackTx {
                ring: b_to_a,
                swap: false,
                loss: b.impairment.loss,
                rng: StdRng::seed_from_u64(b.impairment.seed.wrapping_add(q as u64)),
                local: cb.clone(),
                peer: ca.clone(),
            }));
            a_rx.push(Some(LoopbackRx { ring: a_from_b }));
            b_rx.push(Some(LoopbackRx { ring: b_from_a }));
        }

        (
            LoopbackDevice {
                mac: a.mac,
                tx: a_tx,
                rx: a_rx,
                counters: ca,
            },
            LoopbackDevice {
                mac: b.mac,
                tx: b_tx,
                rx: b_rx,
                counters: cb,
            },
        )
    }

    pub fn snapshot(&self) -> DeviceCounters {
        self.counters.snapshot()
    }
}

impl Device for LoopbackDevice {
    type Tx = LoopbackTx;
    type Rx = LoopbackRx;

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn tx_queue(&mut self, id: usize) -> Result<LoopbackTx, DeviceError> {
        take_queue(&mut self.tx, id)
    }

    fn rx_queue(&mut self, id: usize) -> Result<LoopbackRx, DeviceError> {
        take_queue(&mut self.rx, id)
    }

    fn wait_for_links(&self, _timeout: Duration) -> Result<(), DeviceError> {
        Ok(())
    }

    fn counters(&self) -> Box<dyn CounterSource> {
        Box::new(SharedCounters(self.counters.clone()))
    }
}
