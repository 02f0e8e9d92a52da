//! # Latency Histogram
//!
//! Online distribution of round-trip latencies. Samples land in fixed-width
//! buckets (width chosen at construction, never rebinned) while the exact
//! count, sum, sum of squares, minimum and maximum are tracked alongside.
//!
//! ## File format
//!
//! ```text
//! # latgen latency histogram
//! # bucket_width_ns=1
//! 8123,4
//! 8124,17
//! ```
//!
//! One `latency_ns,count` row per observed bucket, ascending. Lines starting
//! with `#` are comments; a `bucket_width_ns` comment restores the width on
//! load (default 1 ns when absent).

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default bucket width in nanoseconds.
pub const DEFAULT_BUCKET_WIDTH_NS: u64 = 1;

const WIDTH_KEY: &str = "bucket_width_ns=";

#[derive(Debug, Error)]
pub enum HistogramError {
    #[error("histogram I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line}: {msg}")]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },
    #[error("bucket width mismatch: {left} ns vs {right} ns")]
    WidthMismatch { left: u64, right: u64 },
}

// ─── Histogram ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    bucket_width: u64,
    buckets: HashMap<u64, u64>,
    count: u64,
    sum: u128,
    sum_sq: u128,
    min: u64,
    max: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_WIDTH_NS)
    }
}

impl Histogram {
    /// Empty histogram. A zero width is treated as 1 ns.
    pub fn new(bucket_width_ns: u64) -> Self {
        Histogram {
            bucket_width: bucket_width_ns.max(1),
            buckets: HashMap::new(),
            count: 0,
            sum: 0,
            sum_sq: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    /// Record one latency sample in nanoseconds.
    #[inline]
    pub fn update(&mut self, sample_ns: u64) {
        self.add(sample_ns, 1);
    }

    fn add(&mut self, sample_ns: u64, n: u64) {
        if n == 0 {
            return;
        }
        *self.buckets.entry(sample_ns / self.bucket_width).or_insert(0) += n;
        self.count = self.count.saturating_add(n);
        let v = sample_ns as u128;
        self.sum = self.sum.saturating_add(v * n as u128);
        self.sum_sq = self.sum_sq.saturating_add((v * v).saturating_mul(n as u128));
        self.min = self.min.min(sample_ns);
        self.max = self.max.max(sample_ns);
    }

    /// Fold `other` into `self`. Both must share a bucket width.
    pub fn merge(&mut self, other: &Histogram) -> Result<(), HistogramError> {
        if self.bucket_width != other.bucket_width {
            return Err(HistogramError::WidthMismatch {
                left: self.bucket_width,
                right: other.bucket_width,
            });
        }
        for (&bucket, &n) in &other.buckets {
            *self.buckets.entry(bucket).or_insert(0) += n;
        }
        self.count = self.count.saturating_add(other.count);
        self.sum = self.sum.saturating_add(other.sum);
        self.sum_sq = self.sum_sq.saturating_add(other.sum_sq);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        Ok(())
    }

    pub fn bucket_width(&self) -> u64 {
        self.bucket_width
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as u128;
        let spread = n
            .saturating_mul(self.sum_sq)
            .saturating_sub(self.sum.saturating_mul(self.sum));
        Some((spread as f64).sqrt() / self.count as f64)
    }

    /// Observed buckets as `(latency_ns, count)`, ascending.
    pub fn rows(&self) -> Vec<(u64, u64)> {
        let mut rows: Vec<(u64, u64)> = self
            .buckets
            .iter()
            .map(|(&b, &n)| (b * self.bucket_width, n))
            .collect();
        rows.sort_unstable_by_key(|&(v, _)| v);
        rows
    }

    /// Nearest-rank percentile (`p` in `0..=100`), at bucket resolution.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        percentile_of(&self.rows(), self.count, p)
    }

    pub fn summary(&self) -> HistogramSummary {
        let rows = self.rows();
        let pct = |p| percentile_of(&rows, self.count, p).unwrap_or(0);
        HistogramSummary {
            samples: self.count,
            mean_ns: self.mean().unwrap_or(0.0),
            stddev_ns: self.stddev().unwrap_or(0.0),
            min_ns: self.min().unwrap_or(0),
            q1_ns: pct(25.0),
            median_ns: pct(50.0),
            q3_ns: pct(75.0),
            p99_ns: pct(99.0),
            p999_ns: pct(99.9),
            max_ns: self.max().unwrap_or(0),
        }
    }

    /// Print the summary to stdout.
    pub fn print(&self) {
        println!("{}", self.summary());
    }

    // ─── Persistence ─────────────────────────────────────────────────────

    /// Write the CSV form (see module docs).
    pub fn write_csv<W: Write>(&self, mut w: W) -> io::Result<()> {
        writeln!(w, "# latgen latency histogram")?;
        writeln!(w, "# {WIDTH_KEY}{}", self.bucket_width)?;
        writeln!(w, "# samples={}", self.count)?;
        for (latency, n) in self.rows() {
            writeln!(w, "{latency},{n}")?;
        }
        w.flush()
    }

    /// Parse the CSV form. `origin` only labels errors.
    pub fn read_csv<R: BufRead>(reader: R, origin: &Path) -> Result<Histogram, HistogramError> {
        let mut width = None;
        let mut rows = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| HistogramError::Io {
                path: origin.to_path_buf(),
                source,
            })?;
            let parse_err = |msg: String| HistogramError::Parse {
                path: origin.to_path_buf(),
                line: idx + 1,
                msg,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                if let Some(w) = comment.trim().strip_prefix(WIDTH_KEY) {
                    let w: u64 = w
                        .parse()
                        .map_err(|e| parse_err(format!("bad bucket width {w:?}: {e}")))?;
                    if w == 0 {
                        return Err(parse_err("bucket width must be at least 1".into()));
                    }
                    width = Some(w);
                }
                continue;
            }
            let (latency, n) = line
                .split_once(',')
                .ok_or_else(|| parse_err(format!("expected latency_ns,count, got {line:?}")))?;
            let latency: u64 = latency
                .trim()
                .parse()
                .map_err(|e| parse_err(format!("bad latency {latency:?}: {e}")))?;
            let n: u64 = n
                .trim()
                .parse()
                .map_err(|e| parse_err(format!("bad count {n:?}: {e}")))?;
            rows.push((latency, n));
        }

        let mut hist = Histogram::new(width.unwrap_or(DEFAULT_BUCKET_WIDTH_NS));
        for (latency, n) in rows {
            hist.add(latency, n);
        }
        Ok(hist)
    }

    /// Write to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), HistogramError> {
        let path = path.as_ref();
        let io_err = |source| HistogramError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_err)?;
        self.write_csv(BufWriter::new(file)).map_err(io_err)?;
        tracing::info!(path = %path.display(), samples = self.count, "histogram saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Histogram, HistogramError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| HistogramError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::read_csv(BufReader::new(file), path)
    }
}

fn percentile_of(rows: &[(u64, u64)], count: u64, p: f64) -> Option<u64> {
    if count == 0 {
        return None;
    }
    let rank = ((p.clamp(0.0, 100.0) / 100.0) * count as f64).ceil().max(1.0) as u64;
    let mut seen = 0u64;
    for &(value, n) in rows {
        seen += n;
        if seen >= rank {
            return Some(value);
        }
    }
    rows.last().map(|&(v, _)| v)
}

// ─── Summary ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub samples: u64,
    pub mean_ns: f64,
    pub stddev_ns: f64,
    pub min_ns: u64,
    pub q1_ns: u64,
    pub median_ns: u64,
    pub q3_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
    pub max_ns: u64,
}

impl fmt::Display for HistogramSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.samples == 0 {
            return write!(f, "Samples: 0");
        }
        writeln!(
            f,
            "Samples: {}, Average: {:.1} ns, StdDev: {:.1} ns, Quartiles: {}/{}/{} ns",
            self.samples, self.mean_ns, self.stddev_ns, self.q1_ns, self.median_ns, self.q3_ns
        )?;
        write!(
            f,
            "Min: {} ns, 99th: {} ns, 99.9th: {} ns, Max: {} ns",
            self.min_ns, self.p99_ns, self.p999_ns, self.max_ns
        )
    }
}
