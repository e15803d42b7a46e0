//! corrflow demo: one node of a correlator pipeline.
//!
//! A synthetic antenna feed drops packets into a cyclic sample buffer; an
//! input stage cuts it into fixed windows and ships them over a channel to a
//! correlator stage, which accumulates per-substream cross products. At the
//! end a JSON summary of the run is printed on stdout.
//!
//! ```text
//! corrflow [--config <file.toml>] [--mode <MODE>] [--transport <TRANSPORT>] [--print-config]
//! ```

use anyhow::Context;
use clap::Parser;
use corrflow::{
    buffer::{Buffer, Complex32, Complex64, ElementType},
    channel::{ChannelStats, ChannelTag},
    concurrency::{ConcurrencyManager, Direction},
    config::{LoggingSection, ModeChoice, RuntimeConfig, TransportChoice},
    cyclic::{CyclicSampleBuffer, ProducerId, ProducerStats, SampleFlags},
    driver::{DriverReport, SchedulerState, Stage, StageContext, StageDriver, StageOutcome},
    error::{fatal, Result, RuntimeError},
    transport::{
        LoopbackTransport, ReplayTransport, ShmArena, ShmTransport, SocketTransport, Transport,
    },
};
use crossbeam_channel::{bounded, Sender};
use serde::Serialize;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Type tag of the beamlet window Buffer
const WINDOW_TYPE_TAG: u32 = 0xC0_0001;

/// How long the input stage waits for the feed before flagging the gap
const FEED_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "corrflow")]
#[command(about = "Run one correlator node on a synthetic feed", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Channel scheduling, overriding the config
    #[arg(long, value_enum)]
    mode: Option<ModeChoice>,

    /// Reader/writer pool size in asynchronous mode
    #[arg(long)]
    pool_size: Option<usize>,

    /// Channel backend, overriding the config
    #[arg(long, value_enum)]
    transport: Option<TransportChoice>,

    /// File written by `record` and read by `replay`
    #[arg(long)]
    replay_file: Option<PathBuf>,

    /// Number of substreams (stations) in the feed
    #[arg(long)]
    substreams: Option<usize>,

    /// Number of cycles to run
    #[arg(long)]
    cycles: Option<u64>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Load the config file and apply command-line overrides on top.
    fn resolve_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut config = RuntimeConfig::load_or_default(self.config.as_deref())
            .context("failed to load configuration")?;
        let channels = &mut config.channels;
        if let Some(mode) = self.mode {
            channels.mode = mode;
        }
        if let Some(pool_size) = self.pool_size {
            channels.pool_size = pool_size;
        }
        if let Some(transport) = self.transport {
            channels.transport = transport;
        }
        if let Some(path) = &self.replay_file {
            channels.replay_file = Some(path.clone());
        }
        if let Some(substreams) = self.substreams {
            config.buffer.substreams = substreams;
        }
        if let Some(cycles) = self.cycles {
            config.driver.cycles = cycles;
        }
        config.validate().context("invalid command-line override")?;
        Ok(config)
    }
}

fn init_logging(logging: &LoggingSection) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .context("invalid log filter")?;
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "corrflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

/// Layout of one window: all substreams back to back, plus per-substream
/// counts of flagged samples.
fn window_layout(config: &RuntimeConfig) -> Result<Buffer> {
    let mut layout = Buffer::new("beamlet-window", WINDOW_TYPE_TAG, 1);
    layout.add_field(
        "samples",
        ElementType::Complex32,
        config.buffer.substreams * config.buffer.window,
    )?;
    layout.add_field("flagged", ElementType::U32, config.buffer.substreams)?;
    Ok(layout)
}

/// The two ends of the stage-to-stage link. Record and replay runs only have
/// one of them.
fn build_link(config: &RuntimeConfig) -> Result<(Option<Transport>, Option<Transport>)> {
    let channels = &config.channels;
    match channels.transport {
        TransportChoice::Loopback => {
            let (tx, rx) = LoopbackTransport::pair();
            Ok((Some(tx.into()), Some(rx.into())))
        }
        TransportChoice::SharedMemory => {
            let arena = ShmArena::for_process();
            let (a, b) = LoopbackTransport::pair();
            let (mut offer, mut accept): (Transport, Transport) = (a.into(), b.into());
            let producer = ShmTransport::producer(&arena, channels.shm_capacity, &mut offer)?;
            let consumer = ShmTransport::consumer(&arena, &mut accept)?;
            Ok((Some(producer.into()), Some(consumer.into())))
        }
        TransportChoice::Socket => {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            let addr = listener.local_addr()?;
            let tx = SocketTransport::connect(addr)?;
            let rx = SocketTransport::accept(&listener)?;
            Ok((Some(tx.into()), Some(rx.into())))
        }
        TransportChoice::Record | TransportChoice::Replay => {
            let path = channels
                .replay_file
                .as_ref()
                .ok_or_else(|| RuntimeError::Config("replay_file is not set".to_string()))?;
            if channels.transport == TransportChoice::Record {
                Ok((Some(ReplayTransport::record(path)?.into()), None))
            } else {
                Ok((None, Some(ReplayTransport::replay(path)?.into())))
            }
        }
    }
}

/// Synthetic station feed: a tone per substream, with every `loss_every`-th
/// packet dropped.
fn spawn_feed(
    config: &RuntimeConfig,
    cyclic: Arc<CyclicSampleBuffer<Complex32>>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let packet = config.input.packet_samples;
    let loss_every = config.input.loss_every;
    let substreams = config.buffer.substreams;
    let end = (config.driver.cycles + 1) * config.buffer.window as u64;

    let handle = std::thread::Builder::new()
        .name("corrflow-feed".to_string())
        .spawn(move || {
            let producer = ProducerId(0);
            let mut slices: Vec<Vec<Complex32>> = vec![vec![Complex32::default(); packet]; substreams];
            let mut seqno = 0u64;
            let mut time = 0u64;
            while time < end && running.load(Ordering::Relaxed) {
                seqno += 1;
                if loss_every > 0 && seqno % loss_every == 0 {
                    time += packet as u64;
                    continue;
                }
                for (s, slice) in slices.iter_mut().enumerate() {
                    let freq = 0.01 * (s + 1) as f32;
                    for (i, sample) in slice.iter_mut().enumerate() {
                        let phase = freq * (time + i as u64) as f32;
                        *sample = Complex32::from_polar(1.0, phase);
                    }
                }
                let refs: Vec<&[Complex32]> = slices.iter().map(|s| s.as_slice()).collect();
                if let Err(e) = cyclic.put_elements(producer, time, &refs) {
                    tracing::debug!("Feed stopped: {}", e);
                    return;
                }
                time += packet as u64;
            }
            tracing::debug!("Feed finished at time {}", time);
        })?;
    Ok(handle)
}

/// Reads a window out of the cyclic buffer per cycle and sends it on.
struct InputStage {
    cyclic: Arc<CyclicSampleBuffer<Complex32>>,
    output: ChannelTag,
    window: usize,
    scratch: Vec<Vec<Complex32>>,
    flags: Vec<SampleFlags>,
}

impl Stage for InputStage {
    fn name(&self) -> &str {
        "input"
    }

    fn preprocess(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
        let anchor = self.cyclic.start_read(Some(0))?;
        tracing::info!("Input stage anchored at time {}", anchor);
        Ok(())
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        let start = ctx.cycle * self.window as u64;
        let end = start + self.window as u64;
        if !self.cyclic.wait_until_written(end, FEED_TIMEOUT)? {
            tracing::warn!("Feed behind at cycle {}; window will be partly flagged", ctx.cycle);
        }

        let mut out: Vec<&mut [Complex32]> =
            self.scratch.iter_mut().map(|s| s.as_mut_slice()).collect();
        let missing = self
            .cyclic
            .get_elements(&mut out, &mut self.flags, start, self.window)?;
        if missing > 0 {
            tracing::debug!("Cycle {}: {} samples flagged", ctx.cycle, missing);
        }

        let mut entry = ctx.channels.get_write_locked_buffer(self.output)?;
        let Some(buffer) = entry.buffer_mut() else {
            return Err(RuntimeError::InvalidState(
                "write-locked entry is not writable".to_string(),
            ));
        };
        let samples = buffer
            .field_handle("samples")
            .ok_or_else(|| RuntimeError::InvalidField("samples".to_string()))?;
        let flagged = buffer
            .field_handle("flagged")
            .ok_or_else(|| RuntimeError::InvalidField("flagged".to_string()))?;
        let flat: Vec<Complex32> = self.scratch.iter().flatten().copied().collect();
        buffer.write_field(samples, &flat)?;
        let counts: Vec<u32> = self.flags.iter().map(|f| f.count() as u32).collect();
        buffer.write_field(flagged, &counts)?;
        ctx.channels.release(self.output, entry)?;
        Ok(StageOutcome::Continue)
    }
}

/// Accumulated correlation products.
#[derive(Debug, Clone, Serialize)]
struct CorrelationSummary {
    windows: u64,
    flagged_samples: u64,
    /// Mean power per substream
    power: Vec<f64>,
    /// |<conj(s0) * s>| for every substream s
    coherence_with_first: Vec<f64>,
}

/// Correlates each received window and reports the totals on exit.
struct CorrelatorStage {
    input: ChannelTag,
    substreams: usize,
    window: usize,
    replaying: bool,
    windows: u64,
    flagged: u64,
    power: Vec<f64>,
    cross: Vec<Complex64>,
    summary_tx: Sender<CorrelationSummary>,
}

fn widen(c: Complex32) -> Complex64 {
    Complex64::new(c.re as f64, c.im as f64)
}

impl CorrelatorStage {
    fn accumulate(&mut self, samples: &[Complex32]) {
        let (first, _) = samples.split_at(self.window);
        for s in 0..self.substreams {
            let stream = &samples[s * self.window..(s + 1) * self.window];
            for (a, b) in first.iter().zip(stream) {
                let (a, b) = (widen(*a), widen(*b));
                self.power[s] += b.norm_sqr();
                self.cross[s] += a.conj() * b;
            }
        }
        self.windows += 1;
    }
}

impl Stage for CorrelatorStage {
    fn name(&self) -> &str {
        "correlator"
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
        let entry = match ctx.channels.get_read_locked_buffer(self.input) {
            Ok(entry) => entry,
            Err(e) if self.replaying => {
                tracing::info!("Replay ended after {} windows: {}", self.windows, e);
                return Ok(StageOutcome::Finished);
            }
            Err(e) => return Err(e),
        };
        let buffer = entry.buffer();
        let decoded = buffer
            .field_handle("samples")
            .zip(buffer.field_handle("flagged"))
            .ok_or_else(|| RuntimeError::InvalidField("window layout".to_string()))
            .and_then(|(samples, flagged)| {
                Ok((
                    buffer.read_field::<Complex32>(samples)?,
                    buffer.read_field::<u32>(flagged)?,
                ))
            });
        ctx.channels.release(self.input, entry)?;
        let (samples, flagged) = decoded?;

        self.flagged += flagged.iter().map(|&n| n as u64).sum::<u64>();
        self.accumulate(&samples);
        Ok(StageOutcome::Continue)
    }

    fn postprocess(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
        let total = (self.windows * self.window as u64).max(1) as f64;
        let summary = CorrelationSummary {
            windows: self.windows,
            flagged_samples: self.flagged,
            power: self.power.iter().map(|p| p / total).collect(),
            coherence_with_first: self
                .cross
                .iter()
                .map(|c| c.norm() / total)
                .collect(),
        };
        let _ = self.summary_tx.send(summary);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ChannelSummary {
    tag: u32,
    messages_sent: u64,
    messages_received: u64,
    bytes: u64,
    sequence_gaps: u64,
    errors: u64,
    avg_read_time_us: f64,
}

impl ChannelSummary {
    fn new(tag: ChannelTag, stats: &ChannelStats) -> Self {
        Self {
            tag: tag.0,
            messages_sent: stats.messages_sent,
            messages_received: stats.messages_received,
            bytes: stats.bytes_sent + stats.bytes_received,
            sequence_gaps: stats.sequence_gaps,
            errors: stats.errors,
            avg_read_time_us: stats.avg_read_time_us(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    driver: DriverReport,
    feed: ProducerStats,
    channels: Vec<ChannelSummary>,
    correlation: Option<CorrelationSummary>,
}

fn run(config: &RuntimeConfig) -> Result<RunSummary> {
    let state = SchedulerState::new();
    let mut channels = ConcurrencyManager::new(state.tags());
    let layout = window_layout(config)?;
    let mode = config.channels.io_mode();
    let (tx, rx) = build_link(config)?;

    let output = match tx {
        Some(transport) => Some(channels.open(
            layout.clone_layout(),
            layout.clone_layout(),
            transport,
            Direction::Output,
            mode,
        )?),
        None => None,
    };
    let input = match rx {
        Some(transport) => Some(channels.open(
            layout.clone_layout(),
            layout.clone_layout(),
            transport,
            Direction::Input,
            mode,
        )?),
        None => None,
    };

    let mut driver = StageDriver::new(state, channels)
        .with_max_cycles(config.driver.cycles)
        .with_cycle_period(Duration::from_millis(config.driver.cycle_period_ms));

    let b = &config.buffer;
    let cyclic = Arc::new(CyclicSampleBuffer::new(
        b.capacity,
        b.substreams,
        b.allow_overwrite,
        b.window,
    )?);
    let feed_running = Arc::new(AtomicBool::new(true));
    let feed = match output {
        Some(output) => {
            driver.add_stage(Box::new(InputStage {
                cyclic: cyclic.clone(),
                output,
                window: b.window,
                scratch: vec![vec![Complex32::default(); b.window]; b.substreams],
                flags: vec![SampleFlags::new(b.window); b.substreams],
            }));
            Some(spawn_feed(config, cyclic.clone(), feed_running.clone())?)
        }
        None => None,
    };

    let (summary_tx, summary_rx) = bounded(1);
    if let Some(input) = input {
        driver.add_stage(Box::new(CorrelatorStage {
            input,
            substreams: b.substreams,
            window: b.window,
            replaying: config.channels.transport == TransportChoice::Replay,
            windows: 0,
            flagged: 0,
            power: vec![0.0; b.substreams],
            cross: vec![Complex64::default(); b.substreams],
            summary_tx,
        }));
    }

    let report = driver.run();
    feed_running.store(false, Ordering::Relaxed);
    cyclic.clear();
    if let Some(feed) = feed {
        if feed.join().is_err() {
            tracing::warn!("Feed thread panicked");
        }
    }
    let report = report?;

    let channel_stats = driver
        .channels()
        .channel_tags()
        .into_iter()
        .filter_map(|tag| {
            let stats = driver.channels().stats(tag)?;
            Some(ChannelSummary::new(tag, &stats))
        })
        .collect();

    Ok(RunSummary {
        driver: report,
        feed: cyclic.total_stats()?,
        channels: channel_stats,
        correlation: summary_rx.try_recv().ok(),
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    if cli.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    let _guard = init_logging(&config.logging)?;
    tracing::info!(
        "corrflow starting: {} substreams, window {}, {:?} over {:?}",
        config.buffer.substreams,
        config.buffer.window,
        config.channels.mode,
        config.channels.transport
    );

    let summary = match run(&config) {
        Ok(summary) => summary,
        Err(e) if e.is_fatal() => fatal(&e),
        Err(e) => return Err(e).context("pipeline run failed"),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_apply_on_defaults() {
        let cli = Cli::try_parse_from([
            "corrflow",
            "--mode",
            "asynchronous",
            "--pool-size",
            "3",
            "--transport",
            "shared-memory",
            "--cycles",
            "7",
        ])
        .unwrap();
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.channels.mode, ModeChoice::Asynchronous);
        assert_eq!(config.channels.pool_size, 3);
        assert_eq!(config.channels.transport, TransportChoice::SharedMemory);
        assert_eq!(config.driver.cycles, 7);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let cli = Cli::try_parse_from(["corrflow", "--transport", "socket"]).unwrap();
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Cli::try_parse_from(["corrflow", "--frobnicate"]).is_err());
    }
}
