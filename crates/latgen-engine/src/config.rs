use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::frame::{FrameError, MacAddr, MAX_FRAME_LEN, MIN_FRAME_LEN, PROBE_DST_MAC};
use crate::histogram::DEFAULT_BUCKET_WIDTH_NS;
use crate::loadgen::DEFAULT_BATCH_SIZE;
use crate::pool::DEFAULT_POOL_SIZE;
use crate::timestamper::TimestamperConfig;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Mac(#[from] FrameError),
    #[error("{0}")]
    Invalid(String),
}

// ─── Input (all optional) ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BenchConfigInput {
    pub version: u32,
    pub rate_mbit: Option<u32>,
    pub frame_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub pool_size: Option<usize>,
    pub dst_mac: Option<String>,
    pub histogram_file: Option<String>,
    pub bucket_width_ns: Option<u64>,
    pub runtime_s: Option<u64>,
    pub stats_interval_ms: Option<u64>,
    pub link_timeout_s: Option<u64>,
    pub probe: ProbeConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbeConfigInput {
    pub size: Option<usize>,
    pub max_wait_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub warmup_ms: Option<u64>,
    pub interval_us: Option<u64>,
    pub dst_mac: Option<String>,
}

// ─── Resolved ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub version: u32,
    /// Data-queue wire rate.
    pub rate_mbit: u32,
    /// Load frame length without FCS.
    pub frame_size: usize,
    pub batch_size: usize,
    pub pool_size: usize,
    /// Destination of load traffic.
    pub dst: MacAddr,
    pub histogram_file: PathBuf,
    pub bucket_width_ns: u64,
    /// Stop after this long; `None` runs until interrupted.
    pub runtime: Option<Duration>,
    pub stats_interval: Duration,
    pub link_timeout: Duration,
    pub probe: TimestamperConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            rate_mbit: 10_000,
            frame_size: MIN_FRAME_LEN,
            batch_size: DEFAULT_BATCH_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            dst: MacAddr::BROADCAST,
            histogram_file: PathBuf::from("histogram.csv"),
            bucket_width_ns: DEFAULT_BUCKET_WIDTH_NS,
            runtime: None,
            stats_interval: Duration::from_secs(1),
            link_timeout: Duration::from_secs(10),
            probe: TimestamperConfig::default(),
        }
    }
}

impl BenchConfigInput {
    pub fn resolve(self) -> Result<BenchConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let d = BenchConfig::default();
        let p = self.probe;
        let probe = TimestamperConfig {
            probe_len: p.size.unwrap_or(d.probe.probe_len),
            max_wait: p.max_wait_ms.map(Duration::from_millis).unwrap_or(d.probe.max_wait),
            max_latency: p
                .max_latency_ms
                .map(Duration::from_millis)
                .unwrap_or(d.probe.max_latency),
            warmup: p.warmup_ms.map(Duration::from_millis).unwrap_or(d.probe.warmup),
            interval: p.interval_us.map(Duration::from_micros).unwrap_or(d.probe.interval),
            probe_dst: match p.dst_mac {
                Some(s) => s.trim().parse()?,
                None => PROBE_DST_MAC,
            },
        };

        let dst = match self.dst_mac {
            Some(s) => s.trim().parse()?,
            None => d.dst,
        };
        let histogram_file = self
            .histogram_file
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(d.histogram_file);

        let cfg = BenchConfig {
            version,
            rate_mbit: self.rate_mbit.unwrap_or(d.rate_mbit),
            frame_size: self.frame_size.unwrap_or(d.frame_size),
            batch_size: self.batch_size.unwrap_or(d.batch_size),
            pool_size: self.pool_size.unwrap_or(d.pool_size),
            dst,
            histogram_file,
            bucket_width_ns: self.bucket_width_ns.unwrap_or(d.bucket_width_ns),
            runtime: self.runtime_s.filter(|&s| s > 0).map(Duration::from_secs),
            stats_interval: self
                .stats_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(d.stats_interval)
                .max(Duration::from_millis(10)),
            link_timeout: self
                .link_timeout_s
                .map(Duration::from_secs)
                .unwrap_or(d.link_timeout),
            probe,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl BenchConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(BenchConfig::default());
        }
        let parsed: BenchConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check ranges. Call again after applying command-line overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.rate_mbit == 0 {
            return invalid("rate_mbit must be positive".into());
        }
        let frames = MIN_FRAME_LEN..=MAX_FRAME_LEN;
        if !frames.contains(&self.frame_size) {
            return invalid(format!(
                "frame_size {} outside {MIN_FRAME_LEN}..={MAX_FRAME_LEN}",
                self.frame_size
            ));
        }
        if !frames.contains(&self.probe.probe_len) {
            return invalid(format!(
                "probe size {} outside {MIN_FRAME_LEN}..={MAX_FRAME_LEN}",
                self.probe.probe_len
            ));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        if self.pool_size < self.batch_size {
            return invalid(format!(
                "pool_size {} smaller than batch_size {}",
                self.pool_size, self.batch_size
            ));
        }
        if self.bucket_width_ns == 0 {
            return invalid("bucket_width_ns must be at least 1".into());
        }
        if self.probe.max_wait.is_zero() {
            return invalid("probe max_wait_ms must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_gives_defaults() {
        let cfg = BenchConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg.rate_mbit, 10_000);
        assert_eq!(cfg.histogram_file, PathBuf::from("histogram.csv"));
        assert_eq!(cfg.batch_size, 63);
        assert_eq!(cfg.pool_size, 2047);
        assert_eq!(cfg.probe.max_wait, Duration::from_millis(15));
        assert_eq!(cfg.probe.probe_dst, PROBE_DST_MAC);
        assert!(cfg.runtime.is_none());
    }

    #[test]
    fn parse_toml_config_full() {
        let toml = r#"
            version = 1
            rate_mbit = 1000
            frame_size = 128
            dst_mac = "aa:bb:cc:dd:ee:ff"
            histogram_file = "out/h.csv"
            bucket_width_ns = 10
            runtime_s = 30

            [probe]
            max_wait_ms = 20
            warmup_ms = 0
            dst_mac = "02-00-00-00-00-09"
        "#;
        let cfg = BenchConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.rate_mbit, 1000);
        assert_eq!(cfg.frame_size, 128);
        assert_eq!(cfg.dst.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(cfg.histogram_file, PathBuf::from("out/h.csv"));
        assert_eq!(cfg.bucket_width_ns, 10);
        assert_eq!(cfg.runtime, Some(Duration::from_secs(30)));
        assert_eq!(cfg.probe.max_wait, Duration::from_millis(20));
        assert!(cfg.probe.warmup.is_zero());
        assert_eq!(cfg.probe.probe_dst, MacAddr([2, 0, 0, 0, 0, 9]));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for bad in [
            "rate_mbit = 0",
            "frame_size = 59",
            "frame_size = 9001",
            "batch_size = 0",
            "pool_size = 10\nbatch_size = 11",
            "bucket_width_ns = 0",
            "[probe]\nmax_wait_ms = 0",
        ] {
            let err = BenchConfig::from_toml_str(bad).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn rejects_bad_mac_and_version() {
        assert!(matches!(
            BenchConfig::from_toml_str("dst_mac = \"nope\""),
            Err(ConfigError::Mac(_))
        ));
        assert!(matches!(
            BenchConfig::from_toml_str("version = 7"),
            Err(ConfigError::UnsupportedVersion(7))
        ));
        assert!(matches!(
            BenchConfig::from_toml_str("rate_mbit = \"fast\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn zero_runtime_means_unbounded() {
        let cfg = BenchConfig::from_toml_str("runtime_s = 0").unwrap();
        assert!(cfg.runtime.is_none());
    }
}
