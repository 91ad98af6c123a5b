//! ALSA implementations of the device contracts.
//!
//! Capture reads S16LE mono periods, runs the SpeexDSP preprocessor,
//! resamples to the transport rate and hands out fixed-size blocks.
//! Playback owns a writer thread so scheduling never blocks the session
//! loop; an interruption bumps a generation counter and drops whatever
//! the hardware ring still holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use super::device::{InputConfig, InputDevice, InputHandle, OutputDevice, OutputHandle, SampleBlock};
use super::speex::{CaptureChain, RateConverter};
use crate::codec::{self, CAPTURE_BLOCK_SAMPLES, CAPTURE_SAMPLE_RATE};
use crate::error::AudioError;

/// Consecutive `prepare()` recoveries before a stream is declared dead.
const MAX_RECOVERIES: u32 = 3;

// ======================== Device open + negotiation ========================

const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const EACCES: i32 = 13;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;

fn classify_open(device: &str, e: alsa::Error) -> AudioError {
    let detail = format!("'{}': {}", device, e);
    match e.errno() {
        ENOENT | ENODEV => AudioError::DeviceNotFound(detail),
        EPERM | EACCES | EBUSY => AudioError::PermissionDenied(detail),
        _ => AudioError::Unknown(detail),
    }
}

fn negotiate(pcm: &PCM, rate: u32) -> Result<(u32, usize), alsa::Error> {
    {
        let hwp = HwParams::any(pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }
    let hwp = pcm.hw_params_current()?;
    Ok((hwp.get_rate()?, hwp.get_period_size()? as usize))
}

fn open_pcm(device: &str, direction: Direction, rate: u32) -> Result<(PCM, u32, usize), AudioError> {
    let dir_name = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false).map_err(|e| classify_open(device, e))?;
    let (actual_rate, period_size) = negotiate(&pcm, rate).map_err(|e| {
        AudioError::UnsupportedEnvironment(format!(
            "'{}' rejected S16LE mono @{} Hz: {}",
            device, rate, e
        ))
    })?;
    log::info!(
        "ALSA {}: device={}, rate={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        period_size,
    );
    Ok((pcm, actual_rate, period_size))
}

// ======================== Capture ========================

/// Capture side of an ALSA card, addressed by PCM device name.
pub struct AlsaInput {
    device: String,
}

impl AlsaInput {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl InputDevice for AlsaInput {
    fn request_access(&self, config: &InputConfig) -> Result<Box<dyn InputHandle>, AudioError> {
        let (pcm, rate, period_size) = open_pcm(&self.device, Direction::Capture, CAPTURE_SAMPLE_RATE)?;

        if config.echo_cancellation {
            log::debug!("Echo cancellation is left to the capture driver");
        }
        let chain = CaptureChain::new(period_size, rate, CAPTURE_SAMPLE_RATE, config)
            .map_err(|e| AudioError::unknown(format!("capture conditioning: {}", e)))?;

        Ok(Box::new(AlsaInputHandle {
            device: self.device.clone(),
            pcm,
            chain,
            read_buf: vec![0i16; period_size],
            accum: Vec::with_capacity(CAPTURE_BLOCK_SAMPLES * 2),
        }))
    }
}

struct AlsaInputHandle {
    device: String,
    pcm: PCM,
    chain: CaptureChain,
    read_buf: Vec<i16>,
    accum: Vec<f32>,
}

impl InputHandle for AlsaInputHandle {
    fn pull(&mut self) -> Result<SampleBlock, AudioError> {
        let mut recoveries = 0u32;
        while self.accum.len() < CAPTURE_BLOCK_SAMPLES {
            let io = self
                .pcm
                .io_i16()
                .map_err(|e| AudioError::unknown(format!("capture io: {}", e)))?;
            match io.readi(&mut self.read_buf) {
                Ok(0) => continue,
                Ok(frames) => {
                    recoveries = 0;
                    let cleaned = self
                        .chain
                        .process(&mut self.read_buf[..frames])
                        .map_err(|e| {
                            AudioError::unknown(format!("capture conditioning: {}", e))
                        })?;
                    for &s in cleaned {
                        self.accum.push(s as f32 / 32768.0);
                    }
                }
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering", e);
                    recoveries += 1;
                    if recoveries > MAX_RECOVERIES {
                        return Err(classify_open(&self.device, e));
                    }
                    if let Err(e2) = self.pcm.prepare() {
                        return Err(AudioError::unknown(format!(
                            "capture recovery failed: {}",
                            e2
                        )));
                    }
                }
            }
        }
        Ok(self.accum.drain(..CAPTURE_BLOCK_SAMPLES).collect())
    }

    fn release(self: Box<Self>) {
        log::info!("Capture device '{}' released", self.device);
    }
}

// ======================== Playback ========================

enum WriteCmd {
    Audio(u64, Vec<i16>),
    Cut,
}

/// Playback side of an ALSA card, addressed by PCM device name.
pub struct AlsaOutput {
    device: String,
}

impl AlsaOutput {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl OutputDevice for AlsaOutput {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputHandle>, AudioError> {
        let (pcm, actual_rate, _) = open_pcm(&self.device, Direction::Playback, sample_rate)?;
        let converter = if actual_rate != sample_rate {
            Some(
                RateConverter::new(sample_rate, actual_rate)
                    .map_err(|e| AudioError::unknown(format!("playback conversion: {}", e)))?,
            )
        } else {
            None
        };

        let generation = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel::<WriteCmd>();
        let writer_gen = generation.clone();
        let device = self.device.clone();
        let thread = thread::Builder::new()
            .name("playback-write".to_string())
            .spawn(move || writer_loop(pcm, converter, rx, writer_gen, &device))
            .map_err(|e| AudioError::unknown(format!("spawn playback thread: {}", e)))?;

        Ok(Box::new(AlsaOutputHandle {
            epoch: Instant::now(),
            generation,
            tx: Some(tx),
            thread: Some(thread),
        }))
    }
}

struct AlsaOutputHandle {
    epoch: Instant,
    generation: Arc<AtomicU64>,
    tx: Option<mpsc::Sender<WriteCmd>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OutputHandle for AlsaOutputHandle {
    fn clock_now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, samples: Vec<f32>, at: f64) -> Result<(), AudioError> {
        if samples.is_empty() {
            return Ok(());
        }
        // The blocking ring imposes real-time pacing once the stream is
        // hot, so `at` only matters for the log.
        log::trace!("Queueing {} samples for t={:.3}", samples.len(), at);
        // Same mapping as the transport encoder, so the card renders the
        // exact PCM16 values that crossed the wire.
        let pcm16: Vec<i16> = samples.iter().map(|&s| codec::sample_to_i16(s)).collect();
        let tag = self.generation.load(Ordering::SeqCst);
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| AudioError::unknown("playback writer gone"))?;
        tx.send(WriteCmd::Audio(tag, pcm16))
            .map_err(|_| AudioError::unknown("playback writer gone"))
    }

    fn flush(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.tx {
            let _ = tx.send(WriteCmd::Cut);
        }
    }

    fn release(mut self: Box<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(WriteCmd::Cut);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        log::info!("Playback device released");
    }
}

fn writer_loop(
    pcm: PCM,
    mut converter: Option<RateConverter>,
    rx: mpsc::Receiver<WriteCmd>,
    generation: Arc<AtomicU64>,
    device: &str,
) {
    let mut seen_gen = generation.load(Ordering::SeqCst);
    log::info!("Playback writer running on '{}'", device);

    while let Ok(cmd) = rx.recv() {
        let current = generation.load(Ordering::SeqCst);
        if current != seen_gen {
            // Interrupted: cut whatever the ring still holds.
            if let Err(e) = pcm.drop() {
                log::warn!("PCM drop failed: {}", e);
            }
            if let Err(e) = pcm.prepare() {
                log::warn!("PCM prepare after flush failed: {}", e);
            }
            seen_gen = current;
        }
        let (tag, samples) = match cmd {
            WriteCmd::Audio(tag, samples) => (tag, samples),
            WriteCmd::Cut => continue,
        };
        if tag != current {
            // Scheduled before the flush that we just applied.
            continue;
        }

        let out: &[i16] = match converter.as_mut() {
            Some(conv) => match conv.convert(&samples) {
                Ok(out) => out,
                Err(e) => {
                    log::error!("Playback conversion error: {}", e);
                    continue;
                }
            },
            None => &samples,
        };
        write_all(&pcm, out);
    }

    log::info!("Playback writer finished");
}

/// Write with retry to ride out short writes and XRUN recovery; a
/// circuit breaker drops the remainder when the device cannot keep up.
fn write_all(pcm: &PCM, samples: &[i16]) {
    let mut written = 0usize;
    let mut retries = 0u32;
    while written < samples.len() {
        let io = match pcm.io_i16() {
            Ok(io) => io,
            Err(e) => {
                log::error!("Playback io unavailable: {}", e);
                return;
            }
        };
        match io.writei(&samples[written..]) {
            Ok(n) => {
                written += n;
                retries = 0;
            }
            Err(e) => {
                log::warn!("ALSA XRUN or error: {}, recovering", e);
                retries += 1;
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM playback: {}", e2);
                    return;
                }
                if retries >= MAX_RECOVERIES {
                    log::error!(
                        "Max recovery retries reached, dropping {} unwritten frames",
                        samples.len() - written
                    );
                    return;
                }
            }
        }
    }
}
