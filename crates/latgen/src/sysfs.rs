//! Interface counters and link state from `/sys/class/net`.

use std::io;
use std::path::{Path, PathBuf};

use latgen_engine::stats::{CounterSource, DeviceCounters};

pub const SYSFS_NET: &str = "/sys/class/net";

/// Reads `<root>/<iface>/statistics/*`.
pub struct SysfsCounters {
    iface: String,
    dir: PathBuf,
}

impl SysfsCounters {
    pub fn with_root(root: impl AsRef<Path>, iface: &str) -> Self {
        SysfsCounters {
            iface: iface.to_string(),
            dir: root.as_ref().join(iface).join("statistics"),
        }
    }

    fn counter(&self, name: &str) -> io::Result<u64> {
        let text = std::fs::read_to_string(self.dir.join(name))?;
        text.trim().parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}/{name}: {e}", self.iface),
            )
        })
    }
}

impl CounterSource for SysfsCounters {
    fn name(&self) -> &str {
        &self.iface
    }

    fn read(&self) -> io::Result<DeviceCounters> {
        Ok(DeviceCounters {
            tx_packets: self.counter("tx_packets")?,
            tx_bytes: self.counter("tx_bytes")?,
            rx_packets: self.counter("rx_packets")?,
            rx_bytes: self.counter("rx_bytes")?,
            rx_dropped: self.counter("rx_dropped")?,
        })
    }
}

/// `operstate` of `iface`. "unknown" is what virtual and some PMD-less
/// drivers report while passing traffic, so it counts as up.
pub fn link_is_up(root: impl AsRef<Path>, iface: &str) -> io::Result<bool> {
    let state = std::fs::read_to_string(root.as_ref().join(iface).join("operstate"))?;
    Ok(matches!(state.trim(), "up" | "unknown"))
}

/// Hardware address from `<root>/<iface>/address`.
pub fn read_mac(root: impl AsRef<Path>, iface: &str) -> io::Result<String> {
    let text = std::fs::read_to_string(root.as_ref().join(iface).join("address"))?;
    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_iface(name: &str, counters: &[(&str, &str)], operstate: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("latgen-sysfs-{}-{name}", std::process::id()));
        let stats = root.join(name).join("statistics");
        std::fs::create_dir_all(&stats).unwrap();
        for (file, value) in counters {
            std::fs::write(stats.join(file), format!("{value}\n")).unwrap();
        }
        std::fs::write(root.join(name).join("operstate"), format!("{operstate}\n")).unwrap();
        std::fs::write(root.join(name).join("address"), "02:00:00:00:00:2a\n").unwrap();
        root
    }

    #[test]
    fn reads_all_counters() {
        let root = fake_iface(
            "eth9",
            &[
                ("tx_packets", "10"),
                ("tx_bytes", "600"),
                ("rx_packets", "7"),
                ("rx_bytes", "420"),
                ("rx_dropped", "1"),
            ],
            "up",
        );
        let src = SysfsCounters::with_root(&root, "eth9");
        assert_eq!(src.name(), "eth9");
        assert_eq!(
            src.read().unwrap(),
            DeviceCounters {
                tx_packets: 10,
                tx_bytes: 600,
                rx_packets: 7,
                rx_bytes: 420,
                rx_dropped: 1,
            }
        );
        assert!(link_is_up(&root, "eth9").unwrap());
        assert_eq!(read_mac(&root, "eth9").unwrap(), "02:00:00:00:00:2a");
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn garbage_counter_is_an_error() {
        let root = fake_iface("eth8", &[("tx_packets", "lots")], "down");
        let src = SysfsCounters::with_root(&root, "eth8");
        let err = src.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!link_is_up(&root, "eth8").unwrap());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn missing_interface_is_not_found() {
        let src = SysfsCounters::with_root("/nonexistent-latgen", "eth0");
        assert_eq!(src.read().unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
