//! # L2 Reflector
//!
//! The far end of a latency measurement: every frame received on a queue is
//! sent back out with source and destination MAC swapped. Optionally only
//! frames of one EtherType are bounced.

use serde::Serialize;
use std::time::Duration;

use crate::cancel::RunToken;
use crate::device::{DeviceError, RxFrame, RxQueue, TxQueue};
use crate::frame::swap_macs;
use crate::pool::PacketBuffer;

const BURST: usize = 64;
const POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReflectorStats {
    pub received: u64,
    pub reflected: u64,
    /// Frames ignored by the EtherType filter.
    pub filtered: u64,
    /// Frames the transmit queue did not accept.
    pub tx_rejected: u64,
}

pub struct Reflector<T, R> {
    tx: T,
    rx: R,
    ethertype: Option<u16>,
    rx_buf: Vec<RxFrame>,
    tx_buf: Vec<PacketBuffer>,
    stats: ReflectorStats,
}

impl<T: TxQueue, R: RxQueue> Reflector<T, R> {
    pub fn new(tx: T, rx: R) -> Self {
        Reflector {
            tx,
            rx,
            ethertype: None,
            rx_buf: Vec::with_capacity(BURST),
            tx_buf: Vec::with_capacity(BURST),
            stats: ReflectorStats::default(),
        }
    }

    /// Only reflect frames carrying `ethertype`.
    pub fn with_ethertype(mut self, ethertype: u16) -> Self {
        self.ethertype = Some(ethertype);
        self
    }

    pub fn stats(&self) -> ReflectorStats {
        self.stats
    }

    /// Handle one receive burst. Returns the number of frames reflected.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<usize, DeviceError> {
        self.rx_buf.clear();
        let n = self.rx.recv(&mut self.rx_buf, BURST, timeout)?;
        if n == 0 {
            return Ok(0);
        }
        self.stats.received += n as u64;

        self.tx_buf.clear();
        for frame in self.rx_buf.drain(..) {
            if let Some(want) = self.ethertype {
                let ethertype = frame.data.get(12..14).map(|b| u16::from_be_bytes([b[0], b[1]]));
                if ethertype != Some(want) {
                    self.stats.filtered += 1;
                    continue;
                }
            }
            let mut buf = PacketBuffer::copy_from(&frame.data);
            swap_macs(buf.as_mut_slice());
            self.tx_buf.push(buf);
        }
        if self.tx_buf.is_empty() {
            return Ok(0);
        }

        let sent = self.tx.send(&self.tx_buf)?.min(self.tx_buf.len());
        self.stats.reflected += sent as u64;
        self.stats.tx_rejected += (self.tx_buf.len() - sent) as u64;
        Ok(sent)
    }

    /// Reflect until `token` is cancelled.
    pub fn run(&mut self, token: &RunToken) -> Result<ReflectorStats, DeviceError> {
        tracing::info!(ethertype = ?self.ethertype, "reflector started");
        while token.is_running() {
            self.poll_once(POLL)?;
        }
        let s = &self.stats;
        tracing::info!(
            received = s.received,
            reflected = s.reflected,
            filtered = s.filtered,
            tx_rejected = s.tx_rejected,
            "reflector stopped"
        );
        Ok(self.stats)
    }
}
