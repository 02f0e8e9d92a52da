//! # Ethernet Frame Layout
//!
//! Link-layer addressing, the immutable frame template applied by the buffer
//! pool, and the probe marker carried by timestamper packets.
//!
//! ## Probe Frame
//!
//! ```text
//!  0               6               12      14              18              22
//! +---------------+---------------+-------+---------------+---------------+---
//! |  dst MAC (6)  |  src MAC (6)  | 88F7  | magic "LGPB"  |  sequence (32)| pad
//! +---------------+---------------+-------+---------------+---------------+---
//! ```
//!
//! Frames never include the FCS; the device appends it. [`WIRE_OVERHEAD`]
//! accounts for FCS, preamble/SFD and the inter-frame gap when pacing.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Ethernet header: dst (6) + src (6) + EtherType (2).
pub const ETH_HEADER_LEN: usize = 14;

/// Smallest frame a NIC will put on the wire, excluding the 4-byte FCS.
pub const MIN_FRAME_LEN: usize = 60;

/// Largest frame accepted by the pool (jumbo frame, excluding FCS).
pub const MAX_FRAME_LEN: usize = 9000;

/// Per-frame bytes on the wire that are not part of the frame buffer:
/// FCS (4) + preamble and SFD (8) + inter-frame gap (12).
pub const WIRE_OVERHEAD: usize = 24;

/// EtherType used for load traffic.
pub const ETHERTYPE_LOAD: u16 = 0x1234;

/// EtherType used for probes (IEEE 1588 / PTP), so NICs and raw sockets can
/// steer them onto the probe queue.
pub const ETHERTYPE_PTP: u16 = 0x88F7;

/// Magic bytes identifying a latency probe payload.
pub const PROBE_MAGIC: [u8; 4] = *b"LGPB";

/// Default destination override for probes.
pub const PROBE_DST_MAC: MacAddr = MacAddr([0x11, 0x12, 0x13, 0x14, 0x15, 0x16]);

/// Offset of the probe marker inside a frame.
const PROBE_MARKER_OFFSET: usize = ETH_HEADER_LEN;

/// Length of the probe marker (magic + sequence).
const PROBE_MARKER_LEN: usize = 8;

/// Bytes a frame of `frame_len` occupies on the wire, after padding.
#[inline]
pub fn wire_len(frame_len: usize) -> usize {
    frame_len.max(MIN_FRAME_LEN) + WIRE_OVERHEAD
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid MAC address {0:?}")]
    InvalidMac(String),
}

// ─── MacAddr ─────────────────────────────────────────────────────────────────

/// A 48-bit IEEE 802 MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Reads the destination address of a frame, if it is long enough.
    pub fn dst_of(frame: &[u8]) -> Option<MacAddr> {
        frame.get(0..6).map(|b| MacAddr(b.try_into().unwrap_or_default()))
    }

    /// Reads the source address of a frame, if it is long enough.
    pub fn src_of(frame: &[u8]) -> Option<MacAddr> {
        frame
            .get(6..12)
            .map(|b| MacAddr(b.try_into().unwrap_or_default()))
    }
}

impl FromStr for MacAddr {
    type Err = FrameError;

    /// Parses `aa:bb:cc:dd:ee:ff` (also accepts `-` as separator).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || FrameError::InvalidMac(s.to_string());
        let mut out = [0u8; 6];
        let mut parts = s.trim().split(|c: char| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(MacAddr(out))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

// ─── FrameTemplate ───────────────────────────────────────────────────────────

/// Immutable frame prototype. Built once, then stamped onto every buffer the
/// pool preallocates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTemplate {
    dst: MacAddr,
    src: MacAddr,
    ethertype: u16,
    payload: Vec<u8>,
}

impl FrameTemplate {
    /// Load-traffic template: `src → dst`, EtherType [`ETHERTYPE_LOAD`],
    /// zero payload.
    pub fn builder(src: MacAddr, dst: MacAddr) -> FrameTemplateBuilder {
        FrameTemplateBuilder {
            template: FrameTemplate {
                dst,
                src,
                ethertype: ETHERTYPE_LOAD,
                payload: Vec::new(),
            },
        }
    }

    /// Probe template: EtherType [`ETHERTYPE_PTP`] towards `dst`.
    pub fn probe(src: MacAddr, dst: MacAddr) -> FrameTemplate {
        FrameTemplate::builder(src, dst)
            .ethertype(ETHERTYPE_PTP)
            .build()
    }

    pub fn dst(&self) -> MacAddr {
        self.dst
    }

    pub fn src(&self) -> MacAddr {
        self.src
    }

    pub fn ethertype(&self) -> u16 {
        self.ethertype
    }

    /// Writes the template into `buf`, which must be zeroed beyond the
    /// written bytes so padding stays zero.
    pub fn write_into(&self, buf: &mut BytesMut) {
        buf.clear();
        buf.put_slice(&self.dst.0);
        buf.put_slice(&self.src.0);
        buf.put_u16(self.ethertype);
        buf.put_slice(&self.payload);
    }

    /// Length of the template prefix (header + fixed payload).
    pub fn prefix_len(&self) -> usize {
        ETH_HEADER_LEN + self.payload.len()
    }
}

/// Builder for [`FrameTemplate`].
#[derive(Debug, Clone)]
pub struct FrameTemplateBuilder {
    template: FrameTemplate,
}

impl FrameTemplateBuilder {
    pub fn ethertype(mut self, ethertype: u16) -> Self {
        self.template.ethertype = ethertype;
        self
    }

    /// Fixed payload bytes following the Ethernet header.
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.template.payload = payload.into();
        self
    }

    pub fn build(self) -> FrameTemplate {
        self.template
    }
}

// ─── Probe Marker ────────────────────────────────────────────────────────────

/// Writes the probe marker for `sequence` into a frame that already carries
/// the probe template. Returns `false` if the frame is too short.
pub fn write_probe_marker(frame: &mut [u8], sequence: u32) -> bool {
    let Some(slot) = frame.get_mut(PROBE_MARKER_OFFSET..PROBE_MARKER_OFFSET + PROBE_MARKER_LEN)
    else {
        return false;
    };
    slot[..4].copy_from_slice(&PROBE_MAGIC);
    slot[4..].copy_from_slice(&sequence.to_be_bytes());
    true
}

/// Extracts the probe sequence number, or `None` if `frame` is not a probe.
pub fn read_probe_marker(frame: &[u8]) -> Option<u32> {
    if frame.len() < PROBE_MARKER_OFFSET + PROBE_MARKER_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_PTP {
        return None;
    }
    let marker = &frame[PROBE_MARKER_OFFSET..PROBE_MARKER_OFFSET + PROBE_MARKER_LEN];
    if marker[..4] != PROBE_MAGIC {
        return None;
    }
    Some(u32::from_be_bytes([marker[4], marker[5], marker[6], marker[7]]))
}

/// Swaps destination and source MAC in place (reflector behaviour).
pub fn swap_macs(frame: &mut [u8]) {
    if frame.len() < 12 {
        return;
    }
    let (dst, rest) = frame.split_at_mut(6);
    dst.swap_with_slice(&mut rest[..6]);
}
