//! # Raw Ethernet device
//!
//! Linux `AF_PACKET` sockets bound to one interface. Each queue is its own
//! socket so the data and probe paths never share a file descriptor:
//!
//! - tx queues bind with protocol 0 and never receive
//! - rx queue 0 sees every frame (`ETH_P_ALL`), used by the reflector
//! - rx queue 1 sees only probe frames (EtherType 0x88F7)
//!
//! Frames the host itself sent are skipped on receive.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use latgen_engine::device::{
    take_queue, Device, DeviceError, RxFrame, RxQueue, TxQueue, PROBE_QUEUE,
};
use latgen_engine::frame::{MacAddr, ETHERTYPE_PTP, MAX_FRAME_LEN};
use latgen_engine::pool::PacketBuffer;
use latgen_engine::stats::CounterSource;

use crate::sysfs::{self, SysfsCounters, SYSFS_NET};

const QUEUE_PAIRS: usize = 2;
const SOCKET_BUF_BYTES: libc::c_int = 4 * 1024 * 1024;
const LINK_POLL: Duration = Duration::from_millis(100);

// ─── Sockets ─────────────────────────────────────────────────────────────────

fn packet_socket(ifindex: i32, protocol: u16) -> io::Result<OwnedFd> {
    let proto_be = protocol.to_be();
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto_be as libc::c_int) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = proto_be;
    addr.sll_ifindex = ifindex;
    let ret = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let opt = if protocol == 0 {
        libc::SO_SNDBUF
    } else {
        libc::SO_RCVBUF
    };
    unsafe {
        let ret = libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            &SOCKET_BUF_BYTES as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if ret != 0 {
            warn!(
                ifindex,
                "socket buffer resize failed: {}",
                io::Error::last_os_error()
            );
        }
    }
    Ok(sock)
}

fn interface_name(index: u32) -> io::Result<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ret.is_null() {
        return Err(io::Error::last_os_error());
    }
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

// ─── Queues ──────────────────────────────────────────────────────────────────

pub struct RawTx {
    sock: OwnedFd,
}

impl TxQueue for RawTx {
    fn send(&mut self, frames: &[PacketBuffer]) -> Result<usize, DeviceError> {
        for (sent, frame) in frames.iter().enumerate() {
            let data = frame.as_slice();
            let ret = unsafe {
                libc::send(
                    self.sock.as_raw_fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    0,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    // Qdisc or driver ring full: partial acceptance.
                    Some(libc::ENOBUFS) | Some(libc::EAGAIN) => Ok(sent),
                    _ => Err(err.into()),
                };
            }
        }
        Ok(frames.len())
    }
}

pub struct RawRx {
    sock: OwnedFd,
    buf: Vec<u8>,
}

impl RawRx {
    fn new(sock: OwnedFd) -> Self {
        RawRx {
            sock,
            buf: vec![0u8; MAX_FRAME_LEN + 256],
        }
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.sock.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // Round up so sub-millisecond waits still block briefly.
        let ms = timeout.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int;
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        match ret {
            n if n > 0 => Ok(true),
            0 => Ok(false),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// One non-blocking read. `None` when the socket is drained.
    fn read_one(&mut self) -> io::Result<Option<RxFrame>> {
        loop {
            let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            let ret = unsafe {
                libc::recvfrom(
                    self.sock.as_raw_fd(),
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    libc::MSG_DONTWAIT,
                    &mut addr as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                    &mut addr_len,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock => Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    _ => Err(err),
                };
            }
            if addr.sll_pkttype == libc::PACKET_OUTGOING as u8 {
                continue;
            }
            let frame = Bytes::copy_from_slice(&self.buf[..ret as usize]);
            return Ok(Some(RxFrame::new(frame)));
        }
    }
}

impl RxQueue for RawRx {
    fn recv(
        &mut self,
        out: &mut Vec<RxFrame>,
        max: usize,
        timeout: Duration,
    ) -> Result<usize, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut got = 0;
        while got < max {
            match self.read_one()? {
                Some(frame) => {
                    out.push(frame);
                    got += 1;
                }
                None if got > 0 => break,
                None => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() || !self.wait_readable(left)? {
                        break;
                    }
                }
            }
        }
        Ok(got)
    }
}

// ─── Device ──────────────────────────────────────────────────────────────────

/// A kernel network interface opened by index.
pub struct RawDevice {
    index: u32,
    iface: String,
    mac: MacAddr,
    sysfs_root: PathBuf,
    tx: Vec<Option<RawTx>>,
    rx: Vec<Option<RawRx>>,
}

impl RawDevice {
    /// Open interface `index` with the data and probe queue pairs.
    pub fn open(index: u32) -> Result<Self, DeviceError> {
        let iface = interface_name(index)?;
        let sysfs_root = PathBuf::from(SYSFS_NET);
        let mac = sysfs::read_mac(&sysfs_root, &iface)?
            .parse::<MacAddr>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let ifindex = index as i32;
        let mut tx = Vec::with_capacity(QUEUE_PAIRS);
        for _ in 0..QUEUE_PAIRS {
            tx.push(Some(RawTx {
                sock: packet_socket(ifindex, 0)?,
            }));
        }
        let mut rx = Vec::with_capacity(QUEUE_PAIRS);
        for id in 0..QUEUE_PAIRS {
            let protocol = match id {
                PROBE_QUEUE => ETHERTYPE_PTP,
                _ => libc::ETH_P_ALL as u16,
            };
            rx.push(Some(RawRx::new(packet_socket(ifindex, protocol)?)));
        }

        info!(index, iface = %iface, mac = %mac, "opened raw device");
        Ok(RawDevice {
            index,
            iface,
            mac,
            sysfs_root,
            tx,
            rx,
        })
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }
}

impl Device for RawDevice {
    type Tx = RawTx;
    type Rx = RawRx;

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn tx_queue(&mut self, id: usize) -> Result<RawTx, DeviceError> {
        take_queue(&mut self.tx, id)
    }

    fn rx_queue(&mut self, id: usize) -> Result<RawRx, DeviceError> {
        take_queue(&mut self.rx, id)
    }

    fn wait_for_links(&self, timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        loop {
            if sysfs::link_is_up(&self.sysfs_root, &self.iface)? {
                info!(index = self.index, iface = %self.iface, "link up");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::LinkDown(timeout));
            }
            debug!(iface = %self.iface, "waiting for link");
            std::thread::sleep(LINK_POLL);
        }
    }

    fn counters(&self) -> Box<dyn CounterSource> {
        Box::new(SysfsCounters::with_root(&self.sysfs_root, &self.iface))
    }
}
