//! # latgen-engine
//!
//! Constant-bit-rate layer-2 load generation with round-trip latency
//! probing.
//!
//! A load loop saturates the data queue at a fixed wire rate while a
//! timestamper sends marked probes on a separate queue pair and collects
//! their round trips into a histogram.
//!
//! ## Crate structure
//!
//! - [`frame`]: MAC addresses, frame templates, probe marker
//! - [`pool`]: Preallocated, template-stamped packet buffers
//! - [`clock`]: Nanosecond time sources (TSC via quanta, fakes for tests)
//! - [`cancel`]: Run token shared by all loops
//! - [`device`]: Device and queue traits, in-memory loopback device
//! - [`pacer`]: Wire-rate pacing of a transmit queue
//! - [`loadgen`]: Data-queue producer loop
//! - [`timestamper`]: Probe loop and latency classification
//! - [`histogram`]: Latency distribution, summary, CSV persistence
//! - [`stats`]: Throughput counters and the periodic reporter
//! - [`reflector`]: MAC-swapping L2 reflector
//! - [`config`]: TOML configuration
//! - [`runner`]: End-to-end benchmark orchestration

pub mod cancel;
pub mod clock;
pub mod config;
pub mod device;
pub mod frame;
pub mod histogram;
pub mod loadgen;
pub mod pacer;
pub mod pool;
pub mod reflector;
pub mod runner;
pub mod stats;
pub mod timestamper;

pub use cancel::RunToken;
pub use config::{BenchConfig, ConfigError};
pub use histogram::Histogram;
pub use runner::{BenchError, BenchReport, Benchmark};
