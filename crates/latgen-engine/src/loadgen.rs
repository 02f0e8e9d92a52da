//! # Load Generator
//!
//! The data-queue producer loop: allocate a batch, hand it to the (paced)
//! transmit queue, recycle, repeat. All state is loop-local; the only shared
//! thing is the [`RunToken`], checked once per batch.

use serde::Serialize;
use std::thread;

use crate::cancel::RunToken;
use crate::device::{DeviceError, TxQueue};
use crate::pool::{BufferPool, PacketBuffer};

/// Default frames per batch.
pub const DEFAULT_BATCH_SIZE: usize = 63;

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Frames the queue did not accept.
    pub frames_rejected: u64,
    /// Allocations that came back empty.
    pub alloc_retries: u64,
}

pub struct LoadGenerator<Q> {
    queue: Q,
    pool: BufferPool,
    batch: Vec<PacketBuffer>,
    frame_len: usize,
    batch_size: usize,
}

impl<Q: TxQueue> LoadGenerator<Q> {
    pub fn new(queue: Q, pool: BufferPool, frame_len: usize, batch_size: usize) -> Self {
        let batch_size = batch_size.clamp(1, pool.capacity().max(1));
        LoadGenerator {
            queue,
            pool,
            batch: Vec::with_capacity(batch_size),
            frame_len,
            batch_size,
        }
    }

    /// Run until `token` is cancelled. A device error ends the loop and is
    /// returned; the partial report is logged.
    pub fn run(&mut self, token: &RunToken) -> Result<LoadReport, DeviceError> {
        let mut report = LoadReport::default();
        tracing::info!(
            frame_len = self.frame_len,
            batch = self.batch_size,
            pool = self.pool.capacity(),
            "load generator started"
        );

        while token.is_running() {
            let got = self.pool.alloc(&mut self.batch, self.batch_size, self.frame_len);
            if got == 0 {
                report.alloc_retries += 1;
                thread::yield_now();
                continue;
            }

            let sent = match self.queue.send(&self.batch) {
                Ok(n) => n.min(self.batch.len()),
                Err(e) => {
                    self.pool.free(&mut self.batch);
                    tracing::warn!(error = %e, frames_sent = report.frames_sent, "load generator stopped on device error");
                    return Err(e);
                }
            };
            report.frames_sent += sent as u64;
            report.bytes_sent += self.batch[..sent].iter().map(|b| b.len() as u64).sum::<u64>();
            report.frames_rejected += (self.batch.len() - sent) as u64;
            self.pool.free(&mut self.batch);

            if sent == 0 {
                thread::yield_now();
            }
        }

        tracing::info!(
            frames_sent = report.frames_sent,
            bytes_sent = report.bytes_sent,
            frames_rejected = report.frames_rejected,
            alloc_retries = report.alloc_retries,
            "load generator stopped"
        );
        Ok(report)
    }

    pub fn into_queue(self) -> Q {
        self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameTemplate, MacAddr, MIN_FRAME_LEN};
    use crate::pool::DEFAULT_BUF_SIZE;

    /// Accepts up to `accept` frames per call and cancels after `stop_after`
    /// calls.
    struct ScriptedTx {
        token: RunToken,
        calls: usize,
        stop_after: usize,
        accept: usize,
        fail: bool,
    }

    impl TxQueue for ScriptedTx {
        fn send(&mut self, frames: &[PacketBuffer]) -> Result<usize, DeviceError> {
            self.calls += 1;
            if self.calls >= self.stop_after {
                self.token.cancel();
            }
            if self.fail {
                return Err(DeviceError::Io(std::io::Error::other("tx ring gone")));
            }
            Ok(frames.len().min(self.accept))
        }
    }

    fn pool(capacity: usize) -> BufferPool {
        let template = FrameTemplate::builder(MacAddr([2, 0, 0, 0, 0, 1]), MacAddr::BROADCAST).build();
        BufferPool::new(template, capacity, DEFAULT_BUF_SIZE)
    }

    fn scripted(token: &RunToken, stop_after: usize, accept: usize) -> ScriptedTx {
        ScriptedTx {
            token: token.clone(),
            calls: 0,
            stop_after,
            accept,
            fail: false,
        }
    }

    #[test]
    fn sends_full_batches_until_cancelled() {
        let token = RunToken::new();
        let mut lg = LoadGenerator::new(scripted(&token, 10, usize::MAX), pool(128), 60, 32);
        let report = lg.run(&token).unwrap();
        assert_eq!(report.frames_sent, 320);
        assert_eq!(report.bytes_sent, 320 * MIN_FRAME_LEN as u64);
        assert_eq!(report.frames_rejected, 0);
        assert_eq!(lg.pool.available(), 128);
    }

    #[test]
    fn counts_rejected_frames() {
        let token = RunToken::new();
        let mut lg = LoadGenerator::new(scripted(&token, 4, 10), pool(64), 128, 16);
        let report = lg.run(&token).unwrap();
        assert_eq!(report.frames_sent, 40);
        assert_eq!(report.frames_rejected, 24);
        assert_eq!(report.bytes_sent, 40 * 128);
    }

    #[test]
    fn batch_is_capped_by_pool() {
        let token = RunToken::new();
        let mut lg = LoadGenerator::new(scripted(&token, 3, usize::MAX), pool(8), 60, 63);
        let report = lg.run(&token).unwrap();
        assert_eq!(report.frames_sent, 24);
    }

    #[test]
    fn device_error_ends_loop() {
        let token = RunToken::new();
        let mut tx = scripted(&token, 100, 0);
        tx.fail = true;
        let mut lg = LoadGenerator::new(tx, pool(16), 60, 8);
        assert!(matches!(lg.run(&token), Err(DeviceError::Io(_))));
        // Buffers are back in the pool.
        assert_eq!(lg.pool.available(), 16);
    }

    #[test]
    fn cancelled_token_sends_nothing() {
        let token = RunToken::new();
        token.cancel();
        let mut lg = LoadGenerator::new(scripted(&token, 1, usize::MAX), pool(8), 60, 8);
        assert_eq!(lg.run(&token).unwrap(), LoadReport::default());
        assert_eq!(lg.into_queue().calls, 0);
    }
}
