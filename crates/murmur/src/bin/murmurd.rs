//! murmurd - capture demo daemon
//!
//! Creates one capture source fed by a test-tone generator and records it
//! into a shared memory ring that other processes can attach to read-only.
//! Runs for `--seconds`, then unlinks the source and reports what was
//! captured.

use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use clap::Parser;
use murmur::shm::{self, ShmSegment};
use murmur::{
    Core, MemChunk, OutputControl, OutputStream, RealtimeLoop, RealtimeThread, RtPoll,
    SampleFormat, SampleSpec, Source, SourceFlags, SourceNewData, SourceRt,
};
use murmurconf::MurmurConfig;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "murmurd")]
#[command(about = "Capture a test tone into a shared memory recorder")]
#[command(version)]
struct Cli {
    /// Config file replacing ./murmur.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to capture
    #[arg(short, long, default_value = "5")]
    seconds: u64,

    /// Source name (overrides [source].name)
    #[arg(short, long)]
    name: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,
}

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.25;
const RECORDER_INDEX: u32 = 0;

/// Counters shared between the recorder's two halves.
#[derive(Debug, Default)]
struct RecorderStats {
    bytes: AtomicU64,
    chunks: AtomicU64,
    suspended: AtomicBool,
    killed: AtomicBool,
}

struct RecorderControl {
    stats: Arc<RecorderStats>,
}

impl OutputControl for RecorderControl {
    fn index(&self) -> u32 {
        RECORDER_INDEX
    }

    fn suspend(&self, suspending: bool) {
        self.stats.suspended.store(suspending, Ordering::Relaxed);
    }

    fn kill(&self) {
        self.stats.killed.store(true, Ordering::Relaxed);
    }
}

/// Writes captured chunks into a shared memory ring and punches the pages
/// that fall further than `retain` bytes behind the write cursor.
struct RecorderStream {
    segment: ShmSegment,
    cursor: usize,
    punched: usize,
    retain: usize,
    stats: Arc<RecorderStats>,
}

impl RecorderStream {
    fn new(segment: ShmSegment, stats: Arc<RecorderStats>) -> Self {
        let retain = (segment.size() / 4).max(shm::page_size());
        Self {
            segment,
            cursor: 0,
            punched: 0,
            retain,
            stats,
        }
    }

    fn reclaim_stale(&mut self) {
        let stale_end = self.cursor.saturating_sub(self.retain);
        if stale_end >= self.punched + shm::page_size() {
            self.segment.punch(self.punched, stale_end - self.punched);
            self.punched = stale_end;
        }
    }
}

impl OutputStream for RecorderStream {
    fn index(&self) -> u32 {
        RECORDER_INDEX
    }

    fn attach(&mut self) {
        debug!("recorder attached to segment {}", self.segment.id());
    }

    fn detach(&mut self) {
        debug!(
            "recorder detached at offset {} of segment {}",
            self.cursor,
            self.segment.id()
        );
    }

    fn push(&mut self, chunk: &MemChunk) {
        let size = self.segment.size();
        let Some(ring) = self.segment.as_mut_slice() else {
            return;
        };

        let mut data = chunk.as_ref();
        while !data.is_empty() {
            let n = data.len().min(size - self.cursor);
            ring[self.cursor..self.cursor + n].copy_from_slice(&data[..n]);
            data = &data[n..];
            self.cursor += n;
            if self.cursor == size {
                self.cursor = 0;
                self.punched = 0;
            }
        }

        self.reclaim_stale();
        self.stats
            .bytes
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        self.stats.chunks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Generates a sine tone paced by wall-clock time and posts it each cycle.
struct ToneDriver {
    spec: SampleSpec,
    phase: f32,
    last: Instant,
    buf: BytesMut,
}

impl ToneDriver {
    fn new(spec: SampleSpec) -> Self {
        Self {
            spec,
            phase: 0.0,
            last: Instant::now(),
            buf: BytesMut::new(),
        }
    }

    fn cycle(&mut self, rt: &mut SourceRt) {
        let bytes = self.spec.duration_to_bytes(self.last.elapsed());
        if bytes == 0 {
            return;
        }
        // Time left over below one frame carries into the next cycle.
        self.last += self.spec.bytes_to_duration(bytes);

        let frames = bytes / self.spec.frame_size();
        let step = TAU * TONE_HZ / self.spec.rate as f32;

        self.buf.reserve(bytes);
        for _ in 0..frames {
            let value = self.phase.sin() * TONE_AMPLITUDE;
            self.phase = (self.phase + step) % TAU;
            for _ in 0..self.spec.channels {
                put_sample(&mut self.buf, self.spec.format, value);
            }
        }

        let chunk = MemChunk::new(self.buf.split().freeze());
        rt.post(&chunk);
    }
}

fn put_sample(buf: &mut BytesMut, format: SampleFormat, value: f32) {
    match format {
        SampleFormat::U8 => buf.put_u8((value * 127.0 + 128.0) as u8),
        SampleFormat::S16Le => buf.put_i16_le((value * i16::MAX as f32) as i16),
        SampleFormat::S16Be => buf.put_i16((value * i16::MAX as f32) as i16),
        SampleFormat::S32Le => buf.put_i32_le((value as f64 * i32::MAX as f64) as i32),
        SampleFormat::F32Le => buf.put_f32_le(value),
        SampleFormat::F32Be => buf.put_f32(value),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) =
        MurmurConfig::load_with_sources_from(cli.config.as_deref()).context("loading config")?;
    if let Some(name) = cli.name {
        config.source.name = name;
    }

    if cli.show_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&config.telemetry.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("murmurd {} starting", env!("CARGO_PKG_VERSION"));
    for file in &sources.files {
        info!("loaded config from {}", file.display());
    }
    if !sources.env_overrides.is_empty() {
        info!("env overrides: {}", sources.env_overrides.join(", "));
    }

    let format: SampleFormat = config
        .source
        .format
        .parse()
        .with_context(|| format!("[source].format = {:?}", config.source.format))?;
    let spec = SampleSpec::new(format, config.source.sample_rate, config.source.channels);
    if !spec.is_valid() {
        bail!("invalid sample spec {}", spec);
    }

    if config.shm.pool_size == 0 || config.shm.pool_size >= shm::MAX_SEGMENT_SIZE {
        bail!(
            "[shm].pool_size must be in 1..{} bytes, got {}",
            shm::MAX_SEGMENT_SIZE,
            config.shm.pool_size
        );
    }
    let segment = ShmSegment::create(
        config.shm.pool_size,
        config.shm.shared,
        config.shm.mode | shm::OWNER_RW,
    )
    .context("creating recorder segment")?;
    if segment.is_shared() {
        info!(
            "recording into {} ({} bytes)",
            shm::segment_name(segment.id()),
            segment.size()
        );
    } else {
        info!("recording into private segment ({} bytes)", segment.size());
    }

    let core = Core::with_tracing();
    let (handle, mut rt) = Source::new(
        &core,
        SourceNewData::new(config.source.name.clone(), spec).driver("murmurd-tone"),
    )
    .context("creating source")?;

    let rtpoll = RtPoll::new(config.source.name.clone());
    let (queue, inbox) = rtpoll.message_queue(config.realtime.queue_capacity);

    // Captured data waits at most one loop cycle before it is posted.
    let cycle = Duration::from_millis(config.realtime.poll_interval_ms);
    rt.set_latency_probe(Box::new(move || cycle));

    let mut tone = ToneDriver::new(spec);
    let mut rt_loop = RealtimeLoop::new(rtpoll.clone(), cycle);
    rt_loop.register(
        inbox,
        rt,
        Some(Box::new(move |rt: &mut SourceRt| tone.cycle(rt))),
    );

    let thread = RealtimeThread::spawn(&config.realtime.thread_name, rt_loop)
        .context("spawning realtime thread")?;

    let stats = Arc::new(RecorderStats::default());
    {
        let mut source = handle.lock().expect("source mutex poisoned");
        source.set_message_queue(queue);
        source.set_rtpoll(rtpoll);
        source.set_flags(SourceFlags::CAN_SUSPEND);
        source.set_description(Some(format!("{} Hz test tone", TONE_HZ)));
        source.put().context("publishing source")?;

        source
            .attach_output(
                Arc::new(RecorderControl {
                    stats: stats.clone(),
                }),
                Box::new(RecorderStream::new(segment, stats.clone())),
            )
            .context("attaching recorder")?;

        info!(
            "source info: {}",
            serde_json::to_string(&source.info()).context("serializing source info")?
        );
    }

    std::thread::sleep(Duration::from_secs(cli.seconds));

    {
        let mut source = handle.lock().expect("source mutex poisoned");
        info!("capture latency: {:?}", source.latency());
        if let Err(e) = source.flush() {
            warn!("flush before unlink failed: {}", e);
        }
        source.unlink();
    }

    let _rt_loop = thread.stop();
    drop(handle);

    let bytes = stats.bytes.load(Ordering::Relaxed);
    info!(
        "captured {} chunks, {} bytes ({:?} of audio), recorder killed={}",
        stats.chunks.load(Ordering::Relaxed),
        bytes,
        spec.bytes_to_duration(bytes as usize),
        stats.killed.load(Ordering::Relaxed)
    );

    Ok(())
}
