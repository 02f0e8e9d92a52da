//! # latgen
//!
//! Constant-bit-rate layer-2 load generator with round-trip latency
//! measurement. Saturates one port's data queue at a fixed wire rate while
//! probes on a second queue pair measure latency into a histogram.
//!
//! ## Usage
//!
//! ```bash
//! # 10 Gbit/s of 60 B frames through interface index 3 for 30 s
//! latgen run 3 aa:bb:cc:dd:ee:ff --rate 10000 --runtime 30
//!
//! # Bounce everything back on the device under test
//! latgen reflect 4
//!
//! # Self-contained smoke run, no NIC needed
//! latgen run --loopback --rate 100 --runtime 2 --report report.json
//!
//! # Five 60 s runs into histogram_0.csv .. histogram_4.csv, merged into
//! # acc_histogram.csv; rerunning only redoes the missing ones
//! latgen run 3 aa:bb:cc:dd:ee:ff --runtime 60 --repetitions 5
//!
//! # Merge per-run histograms
//! latgen accumulate -o all.csv run1.csv run2.csv
//! ```

mod raw;
mod sysfs;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use latgen_engine::clock::QuantaClock;
use latgen_engine::device::loopback::{LoopbackConfig, LoopbackDevice};
use latgen_engine::device::{Device, DATA_QUEUE};
use latgen_engine::frame::MacAddr;
use latgen_engine::reflector::Reflector;
use latgen_engine::{BenchConfig, BenchReport, Benchmark, Histogram, RunToken};

use raw::RawDevice;

/// CBR load generator with latency histograms.
#[derive(Parser, Debug)]
#[command(name = "latgen", about = "CBR layer-2 load generator with latency histograms")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate load and measure latency.
    Run(RunArgs),
    /// Swap MACs and send every received frame back.
    Reflect(ReflectArgs),
    /// Merge saved histograms into one file.
    Accumulate(AccumulateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Interface index to transmit and receive on.
    #[arg(required_unless_present = "loopback")]
    device: Option<u32>,

    /// Destination MAC of load traffic (default broadcast).
    dst: Option<String>,

    /// Data-queue wire rate in Mbit/s [default: 10000].
    #[arg(short, long)]
    rate: Option<u32>,

    /// Histogram output file [default: histogram.csv].
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Stop after this many seconds (default: until Ctrl-C).
    #[arg(short = 't', long)]
    runtime: Option<u64>,

    /// TOML configuration; flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Load frame size in bytes, without FCS [default: 60].
    #[arg(long)]
    frame_size: Option<usize>,

    /// Write the run report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Use an in-memory echo device instead of a NIC.
    #[arg(long, default_value_t = false)]
    loopback: bool,

    /// Number of runs. Each writes `<stem>_<i>.csv`; runs whose file exists
    /// are skipped, and all are merged into `acc_<stem>.csv`.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    repetitions: u32,
}

#[derive(Args, Debug)]
struct ReflectArgs {
    /// Interface index to reflect on.
    device: u32,

    /// Only reflect frames of this EtherType (hex, e.g. 0x88f7).
    #[arg(long, value_parser = parse_ethertype)]
    ethertype: Option<u16>,

    /// Stop after this many seconds (default: until Ctrl-C).
    #[arg(short = 't', long)]
    runtime: Option<u64>,
}

#[derive(Args, Debug)]
struct AccumulateArgs {
    /// Merged output file.
    #[arg(short, long)]
    output: PathBuf,

    /// Histogram files to merge.
    #[arg(required = true, num_args = 1..)]
    inputs: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
        Command::Reflect(args) => reflect(args),
        Command::Accumulate(args) => accumulate(args),
    }
}

// ─── Signals ─────────────────────────────────────────────────────────────────

fn install_interrupt(token: &RunToken) -> anyhow::Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, stopping");
        token.cancel();
    })
    .context("failed to install Ctrl-C handler")
}

// ─── run ─────────────────────────────────────────────────────────────────────

fn bench_config(args: &RunArgs) -> anyhow::Result<BenchConfig> {
    let mut cfg = match &args.config {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::default(),
    };
    if let Some(dst) = &args.dst {
        cfg.dst = dst
            .parse::<MacAddr>()
            .with_context(|| format!("bad destination MAC {dst:?}"))?;
    }
    if let Some(rate) = args.rate {
        cfg.rate_mbit = rate;
    }
    if let Some(file) = &args.file {
        cfg.histogram_file = file.clone();
    }
    if let Some(secs) = args.runtime {
        cfg.runtime = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(size) = args.frame_size {
        cfg.frame_size = size;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let cfg = bench_config(&args)?;
    let interrupt = RunToken::new();
    install_interrupt(&interrupt)?;
    let reports = run_repetitions(&args, &cfg, &interrupt)?;

    if let Some(path) = &args.report {
        let json = match reports.as_slice() {
            [single] => serde_json::to_string_pretty(single),
            all => serde_json::to_string_pretty(all),
        }
        .context("failed to encode report")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        tracing::info!(path = %path.display(), "report written");
    }
    Ok(())
}

/// Run every pending repetition, then merge their histograms. Each run gets
/// its own child token, so one run ending does not stop the next while an
/// interrupt stops them all.
fn run_repetitions(
    args: &RunArgs,
    cfg: &BenchConfig,
    interrupt: &RunToken,
) -> anyhow::Result<Vec<BenchReport>> {
    if args.repetitions == 1 {
        return Ok(vec![run_once(args, cfg.clone(), &interrupt.child())?]);
    }

    if cfg.runtime.is_none() {
        bail!("--repetitions needs a --runtime so each run ends");
    }
    let files: Vec<PathBuf> = (0..args.repetitions)
        .map(|rep| repetition_path(&cfg.histogram_file, rep))
        .collect();
    let mut reports = Vec::new();
    for (rep, file) in files.iter().enumerate() {
        if !interrupt.is_running() {
            break;
        }
        if file.exists() {
            tracing::info!(repetition = rep, file = %file.display(), "already done, skipping");
            continue;
        }
        tracing::info!(repetition = rep, of = args.repetitions, "starting repetition");
        let rep_cfg = BenchConfig {
            histogram_file: file.clone(),
            ..cfg.clone()
        };
        reports.push(run_once(args, rep_cfg, &interrupt.child())?);
    }

    if !interrupt.is_running() {
        tracing::warn!("interrupted, not accumulating repetitions");
        return Ok(reports);
    }
    let acc = accumulated_path(&cfg.histogram_file);
    if acc.exists() {
        tracing::info!(file = %acc.display(), "accumulated histogram exists, skipping");
        return Ok(reports);
    }
    let merged = merge_files(&files)?;
    tracing::info!(
        repetitions = files.len(),
        samples = merged.count(),
        output = %acc.display(),
        "repetitions accumulated"
    );
    merged.print();
    merged.save(&acc)?;
    Ok(reports)
}

fn run_once(args: &RunArgs, cfg: BenchConfig, token: &RunToken) -> anyhow::Result<BenchReport> {
    let bench = Benchmark::new(cfg, QuantaClock::new());
    if args.loopback {
        let mut dev = LoopbackDevice::echo(LoopbackConfig::default());
        return run_on(&bench, &mut dev, token);
    }
    let Some(index) = args.device else {
        bail!("a device index is required without --loopback");
    };
    let mut dev =
        RawDevice::open(index).with_context(|| format!("failed to open device {index}"))?;
    tracing::info!(iface = dev.iface(), "using raw device");
    run_on(&bench, &mut dev, token)
}

/// `dir/histogram.csv` → `dir/histogram_<rep>.csv`.
fn repetition_path(base: &Path, rep: u32) -> PathBuf {
    with_file_stem(base, |stem| format!("{stem}_{rep}"))
}

/// `dir/histogram.csv` → `dir/acc_histogram.csv`.
fn accumulated_path(base: &Path) -> PathBuf {
    with_file_stem(base, |stem| format!("acc_{stem}"))
}

fn with_file_stem(base: &Path, rename: impl FnOnce(&str) -> String) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "histogram".into());
    let mut name = rename(&stem);
    if let Some(ext) = base.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    base.with_file_name(name)
}

fn run_on<D: Device>(
    bench: &Benchmark<QuantaClock>,
    dev: &mut D,
    token: &RunToken,
) -> anyhow::Result<BenchReport> {
    let report = bench.run(dev, token).context("benchmark failed")?;
    tracing::info!(
        frames_sent = report.load.frames_sent,
        probes_sent = report.probes.sent,
        probes_completed = report.probes.completed,
        probes_timed_out = report.probes.timed_out,
        probes_discarded = report.probes.discarded,
        histogram = %report.histogram_file.display(),
        "run finished"
    );
    Ok(report)
}

// ─── reflect ─────────────────────────────────────────────────────────────────

fn reflect(args: ReflectArgs) -> anyhow::Result<()> {
    let mut dev = RawDevice::open(args.device)
        .with_context(|| format!("failed to open device {}", args.device))?;
    dev.wait_for_links(Duration::from_secs(10))?;

    let token = RunToken::new();
    install_interrupt(&token)?;
    let timer = args
        .runtime
        .filter(|&s| s > 0)
        .map(|s| token.cancel_after(Duration::from_secs(s)));

    let mut reflector = Reflector::new(dev.tx_queue(DATA_QUEUE)?, dev.rx_queue(DATA_QUEUE)?);
    if let Some(ethertype) = args.ethertype {
        reflector = reflector.with_ethertype(ethertype);
    }
    let stats = reflector.run(&token)?;

    token.cancel();
    if let Some(timer) = timer {
        let _ = timer.join();
    }
    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

fn parse_ethertype(s: &str) -> Result<u16, String> {
    let hex = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(hex, 16).map_err(|e| format!("invalid EtherType {s:?}: {e}"))
}

// ─── accumulate ──────────────────────────────────────────────────────────────

fn accumulate(args: AccumulateArgs) -> anyhow::Result<()> {
    let merged = merge_files(&args.inputs)?;
    tracing::info!(
        files = args.inputs.len(),
        samples = merged.count(),
        output = %args.output.display(),
        "histograms merged"
    );
    merged.print();
    merged.save(&args.output)?;
    Ok(())
}

fn merge_files(paths: &[PathBuf]) -> anyhow::Result<Histogram> {
    let Some((first, rest)) = paths.split_first() else {
        bail!("no input histograms");
    };
    let mut merged = Histogram::load(first)?;
    for path in rest {
        let hist = Histogram::load(path)?;
        merged
            .merge(&hist)
            .with_context(|| format!("cannot merge {}", path.display()))?;
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_run(argv: &[&str]) -> RunArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn run_flags_override_defaults() {
        let args = parse_run(&[
            "latgen", "run", "3", "aa:bb:cc:dd:ee:ff", "-r", "1000", "-f", "out.csv", "-t", "5",
        ]);
        assert_eq!(args.device, Some(3));
        let cfg = bench_config(&args).unwrap();
        assert_eq!(cfg.rate_mbit, 1000);
        assert_eq!(cfg.dst.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(cfg.histogram_file, PathBuf::from("out.csv"));
        assert_eq!(cfg.runtime, Some(Duration::from_secs(5)));
    }

    #[test]
    fn run_defaults_match_classic_tool() {
        let cfg = bench_config(&parse_run(&["latgen", "run", "0"])).unwrap();
        assert_eq!(cfg.rate_mbit, 10_000);
        assert_eq!(cfg.histogram_file, PathBuf::from("histogram.csv"));
        assert!(cfg.runtime.is_none());
    }

    #[test]
    fn device_required_unless_loopback() {
        assert!(Cli::try_parse_from(["latgen", "run"]).is_err());
        let args = parse_run(&["latgen", "run", "--loopback"]);
        assert!(args.loopback);
        assert_eq!(args.device, None);
    }

    #[test]
    fn bad_overrides_are_rejected() {
        let args = parse_run(&["latgen", "run", "1", "not-a-mac"]);
        assert!(bench_config(&args).is_err());
        let args = parse_run(&["latgen", "run", "1", "--rate", "0"]);
        assert!(bench_config(&args).is_err());
        let args = parse_run(&["latgen", "run", "1", "--frame-size", "20"]);
        assert!(bench_config(&args).is_err());
    }

    #[test]
    fn ethertype_parses_hex() {
        assert_eq!(parse_ethertype("0x88f7"), Ok(0x88F7));
        assert_eq!(parse_ethertype("1234"), Ok(0x1234));
        assert!(parse_ethertype("0xzz").is_err());
    }

    #[test]
    fn accumulate_merges_inputs() {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        let a = dir.join(format!("latgen-acc-{pid}-a.csv"));
        let b = dir.join(format!("latgen-acc-{pid}-b.csv"));
        let out = dir.join(format!("latgen-acc-{pid}-out.csv"));

        let mut h = Histogram::default();
        h.update(100);
        h.update(200);
        h.save(&a).unwrap();
        let mut h = Histogram::default();
        h.update(100);
        h.save(&b).unwrap();

        accumulate(AccumulateArgs {
            output: out.clone(),
            inputs: vec![a.clone(), b.clone()],
        })
        .unwrap();
        let merged = Histogram::load(&out).unwrap();
        assert_eq!(merged.count(), 3);
        assert_eq!(merged.rows(), vec![(100, 2), (200, 1)]);

        for p in [a, b, out] {
            std::fs::remove_file(p).ok();
        }
    }

    #[test]
    fn repetition_file_names() {
        let base = Path::new("out/histogram.csv");
        assert_eq!(repetition_path(base, 0), PathBuf::from("out/histogram_0.csv"));
        assert_eq!(repetition_path(base, 12), PathBuf::from("out/histogram_12.csv"));
        assert_eq!(accumulated_path(base), PathBuf::from("out/acc_histogram.csv"));
        assert_eq!(repetition_path(Path::new("h"), 1), PathBuf::from("h_1"));
    }

    #[test]
    fn repetitions_need_runtime_and_at_least_one() {
        assert!(Cli::try_parse_from(["latgen", "run", "1", "--repetitions", "0"]).is_err());
        let args = parse_run(&["latgen", "run", "--loopback", "--repetitions", "2"]);
        let cfg = bench_config(&args).unwrap();
        assert!(run_repetitions(&args, &cfg, &RunToken::new()).is_err());
    }

    #[test]
    fn two_loopback_repetitions_accumulate_and_resume() {
        let dir = std::env::temp_dir().join(format!("latgen-reps-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let base = dir.join("histogram.csv");
        let config = dir.join("bench.toml");
        std::fs::write(
            &config,
            "stats_interval_ms = 100\n[probe]\nwarmup_ms = 20\nmax_wait_ms = 5\n",
        )
        .unwrap();
        let argv = [
            "latgen",
            "run",
            "--loopback",
            "--rate",
            "100",
            "-t",
            "1",
            "--repetitions",
            "2",
            "-f",
            base.to_str().unwrap(),
            "-c",
            config.to_str().unwrap(),
        ];
        let args = parse_run(&argv);
        let cfg = bench_config(&args).unwrap();

        let reports = run_repetitions(&args, &cfg, &RunToken::new()).unwrap();
        assert_eq!(reports.len(), 2);
        let first = Histogram::load(dir.join("histogram_0.csv")).unwrap();
        let second = Histogram::load(dir.join("histogram_1.csv")).unwrap();
        assert_eq!(first.count(), reports[0].histogram.count());
        assert_eq!(second.count(), reports[1].histogram.count());
        assert!(first.count() > 0);
        let acc = Histogram::load(dir.join("acc_histogram.csv")).unwrap();
        assert_eq!(acc.count(), first.count() + second.count());

        // Everything on disk already: nothing reruns, nothing is rewritten.
        let again = run_repetitions(&args, &cfg, &RunToken::new()).unwrap();
        assert!(again.is_empty());
        assert_eq!(
            Histogram::load(dir.join("acc_histogram.csv")).unwrap().count(),
            acc.count()
        );
        std::fs::remove_dir_all(&dir).ok();
    }
}
