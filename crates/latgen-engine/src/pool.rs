//! # Packet Buffer Pool
//!
//! Pre-allocated pool of fixed-capacity frame buffers. Every buffer is stamped
//! with the [`FrameTemplate`] once, at construction; allocation only adjusts the
//! frame length, so the hot path never rewrites addressing.
//!
//! At 10 Gbit/s with 60-byte frames the load loop pushes ~14.88 Mpps. A
//! 2047-buffer pool of 2 KiB slots (4 MiB) keeps the whole working set hot.

use bytes::BytesMut;

use crate::frame::{FrameTemplate, MIN_FRAME_LEN};

/// Default pool size, in buffers.
pub const DEFAULT_POOL_SIZE: usize = 2047;

/// Default per-buffer capacity in bytes.
pub const DEFAULT_BUF_SIZE: usize = 2048;

// ─── PacketBuffer ────────────────────────────────────────────────────────────

/// One link-layer frame (without FCS).
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    data: BytesMut,
}

impl PacketBuffer {
    fn from_template(template: &FrameTemplate, buf_size: usize) -> Self {
        let mut data = BytesMut::with_capacity(buf_size);
        template.write_into(&mut data);
        data.resize(buf_size.max(template.prefix_len()), 0);
        PacketBuffer { data }
    }

    /// Wraps a copy of `frame`, e.g. for forwarding a received frame.
    pub fn copy_from(frame: &[u8]) -> Self {
        PacketBuffer {
            data: BytesMut::from(frame),
        }
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Sets the frame length. Bytes past the template are zero, so growing
    /// exposes zero padding and shrinking never touches the header.
    fn set_len(&mut self, len: usize) {
        if self.data.len() != len {
            self.data.resize(len, 0);
        }
    }
}

// ─── BufferPool ──────────────────────────────────────────────────────────────

/// Bounded, reusable store of template-initialised buffers.
///
/// Allocation never grows the pool: when it runs dry, [`BufferPool::alloc`]
/// hands out fewer buffers (possibly none) and the caller retries after
/// returning buffers with [`BufferPool::free`].
pub struct BufferPool {
    free: Vec<PacketBuffer>,
    template: FrameTemplate,
    capacity: usize,
    buf_size: usize,
}

impl BufferPool {
    /// Preallocate `capacity` buffers of `buf_size` bytes, each carrying
    /// `template`.
    pub fn new(template: FrameTemplate, capacity: usize, buf_size: usize) -> Self {
        let buf_size = buf_size.max(MIN_FRAME_LEN);
        let free = (0..capacity)
            .map(|_| PacketBuffer::from_template(&template, buf_size))
            .collect();
        BufferPool {
            free,
            template,
            capacity,
            buf_size,
        }
    }

    /// Move up to `count` buffers into `batch`, each sized to `frame_len`
    /// (padded to [`MIN_FRAME_LEN`], capped at the buffer size).
    ///
    /// Returns the number of buffers added.
    pub fn alloc(&mut self, batch: &mut Vec<PacketBuffer>, count: usize, frame_len: usize) -> usize {
        let len = frame_len.clamp(MIN_FRAME_LEN, self.buf_size);
        let n = count.min(self.free.len());
        let start = self.free.len() - n;
        batch.extend(self.free.drain(start..).map(|mut buf| {
            buf.set_len(len);
            buf
        }));
        n
    }

    /// Return every buffer in `batch` to the pool.
    pub fn free(&mut self, batch: &mut Vec<PacketBuffer>) {
        let room = self.capacity - self.free.len();
        if batch.len() > room {
            // Foreign buffers beyond capacity are dropped.
            batch.truncate(room);
        }
        self.free.append(batch);
    }

    /// Buffers ready to be allocated.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn template(&self) -> &FrameTemplate {
        &self.template
    }
}
