//! # Device Interface
//!
//! The narrow surface the engine needs from a network device: owned transmit
//! and receive queue handles, the port MAC, a link check, and throughput
//! counters. Queue handles are moved into the loop that uses them, so the data
//! and probe queue pairs never share mutable state.

pub mod loopback;

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use crate::frame::MacAddr;
use crate::pool::PacketBuffer;
use crate::stats::CounterSource;

/// Queue pair carrying load traffic.
pub const DATA_QUEUE: usize = 0;

/// Queue pair carrying latency probes.
pub const PROBE_QUEUE: usize = 1;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("queue {queue} out of range (device has {count})")]
    NoSuchQueue { queue: usize, count: usize },
    #[error("queue {0} already handed out")]
    QueueTaken(usize),
    #[error("link not up after {0:?}")]
    LinkDown(Duration),
    #[error("rate of {0} Mbit/s is not usable")]
    InvalidRate(u32),
    #[error("transmit rate already fixed for this run")]
    RateLocked,
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Frames ──────────────────────────────────────────────────────────────────

/// A frame delivered by a receive queue.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub data: Bytes,
    /// Device receive timestamp in the device clock domain, if the hardware
    /// provides one.
    pub timestamp_ns: Option<u64>,
}

impl RxFrame {
    pub fn new(data: Bytes) -> Self {
        RxFrame {
            data,
            timestamp_ns: None,
        }
    }
}

// ─── Queue traits ────────────────────────────────────────────────────────────

/// One transmit channel.
pub trait TxQueue: Send {
    /// Hand `frames` to the device. Returns how many were accepted; accepted
    /// buffers have been copied and may be recycled immediately.
    fn send(&mut self, frames: &[PacketBuffer]) -> Result<usize, DeviceError>;

    /// Hardware transmit timestamp of the last accepted frame, if supported.
    fn tx_timestamp(&mut self) -> Option<u64> {
        None
    }
}

/// One receive channel.
pub trait RxQueue: Send {
    /// Append up to `max` frames to `out`, waiting at most `timeout` for the
    /// first one. Returns the number appended; zero means the wait expired.
    fn recv(
        &mut self,
        out: &mut Vec<RxFrame>,
        max: usize,
        timeout: Duration,
    ) -> Result<usize, DeviceError>;
}

impl<T: TxQueue + ?Sized> TxQueue for Box<T> {
    fn send(&mut self, frames: &[PacketBuffer]) -> Result<usize, DeviceError> {
        (**self).send(frames)
    }

    fn tx_timestamp(&mut self) -> Option<u64> {
        (**self).tx_timestamp()
    }
}

impl<R: RxQueue + ?Sized> RxQueue for Box<R> {
    fn recv(
        &mut self,
        out: &mut Vec<RxFrame>,
        max: usize,
        timeout: Duration,
    ) -> Result<usize, DeviceError> {
        (**self).recv(out, max, timeout)
    }
}

// ─── Device ──────────────────────────────────────────────────────────────────

/// A configured port with a fixed number of queue pairs.
pub trait Device {
    type Tx: TxQueue + 'static;
    type Rx: RxQueue + 'static;

    /// MAC address of the port.
    fn mac(&self) -> MacAddr;

    /// Take ownership of transmit queue `id`. Each queue can be taken once.
    fn tx_queue(&mut self, id: usize) -> Result<Self::Tx, DeviceError>;

    /// Take ownership of receive queue `id`. Each queue can be taken once.
    fn rx_queue(&mut self, id: usize) -> Result<Self::Rx, DeviceError>;

    /// Block until the link is up or `timeout` elapses.
    fn wait_for_links(&self, timeout: Duration) -> Result<(), DeviceError>;

    /// Throughput counters for the stats reporter.
    fn counters(&self) -> Box<dyn CounterSource>;
}

/// Pops slot `id` out of a queue table.
pub fn take_queue<Q>(slots: &mut [Option<Q>], id: usize) -> Result<Q, DeviceError> {
    let count = slots.len();
    slots
        .get_mut(id)
        .ok_or(DeviceError::NoSuchQueue { queue: id, count })?
        .take()
        .ok_or(DeviceError::QueueTaken(id))
}
