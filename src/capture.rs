//! Microphone capture pipeline: device blocks → transport frames.
//!
//! Pulls fixed-size sample blocks on a dedicated OS thread (NOT a tokio
//! task, to keep device pacing away from async scheduling), encodes each
//! block, and hands the frame to a sink closure unless the mute gate is
//! set.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::{InputConfig, InputDevice, InputHandle};
use crate::codec::{self, TransportFrame, CAPTURE_SAMPLE_RATE};
use crate::error::AudioError;

/// Owns the input-device session and the pull thread feeding the sink.
///
/// Constructed running via [`CaptureEncoder::start`]; [`stop`] (or drop)
/// joins the thread, which releases the device handle on its way out.
///
/// [`stop`]: CaptureEncoder::stop
pub struct CaptureEncoder {
    running: Arc<AtomicBool>,
    gated: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureEncoder {
    /// Acquire an input-device session.
    ///
    /// Asks for the preferred processing chain first; if the device rejects
    /// it, retries once with the minimal configuration. The error of the
    /// final attempt propagates with its classification intact.
    pub fn open(device: &dyn InputDevice) -> Result<Box<dyn InputHandle>, AudioError> {
        match device.request_access(&InputConfig::preferred()) {
            Ok(handle) => Ok(handle),
            Err(first) => {
                log::warn!(
                    "Preferred capture config rejected ({}), retrying minimal",
                    first
                );
                device.request_access(&InputConfig::minimal())
            }
        }
    }

    /// Start the pull loop over an acquired handle.
    ///
    /// * `handle`   - Device session from [`CaptureEncoder::open`]
    /// * `gated`    - Initial mute-gate position
    /// * `sink`     - Receives one transport frame per ungated block
    /// * `on_error` - Called once if the device fails mid-session; a clean
    ///   [`stop`](CaptureEncoder::stop) never triggers it
    pub fn start<S, E>(
        handle: Box<dyn InputHandle>,
        gated: bool,
        sink: S,
        on_error: E,
    ) -> Result<Self, AudioError>
    where
        S: Fn(TransportFrame) + Send + 'static,
        E: FnOnce(AudioError) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let gate = Arc::new(AtomicBool::new(gated));

        let thread = {
            let running = running.clone();
            let gate = gate.clone();
            thread::Builder::new()
                .name("capture-pull".into())
                .spawn(move || pull_loop(handle, &running, &gate, sink, on_error))
                .map_err(|e| AudioError::unknown(format!("capture thread spawn: {}", e)))?
        };

        Ok(Self {
            running,
            gated: gate,
            thread: Some(thread),
        })
    }

    /// Move the mute gate. Takes effect at the next send decision, so a
    /// block already pulled but not yet delivered is still suppressed.
    pub fn set_gated(&self, gated: bool) {
        self.gated.store(gated, Ordering::SeqCst);
    }

    pub fn is_gated(&self) -> bool {
        self.gated.load(Ordering::SeqCst)
    }

    /// Signal the pull thread to stop and wait for it to release the
    /// device. Safe to call more than once.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CaptureEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pull_loop<S, E>(
    mut handle: Box<dyn InputHandle>,
    running: &AtomicBool,
    gated: &AtomicBool,
    sink: S,
    on_error: E,
) where
    S: Fn(TransportFrame),
    E: FnOnce(AudioError),
{
    log::info!(
        "Capture started: rate={}Hz, block={} samples",
        CAPTURE_SAMPLE_RATE,
        codec::CAPTURE_BLOCK_SAMPLES,
    );

    let mut exit_error = None;

    while running.load(Ordering::Relaxed) {
        match handle.pull() {
            Ok(block) => {
                // A stop issued while this block was in flight drops it.
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                // Idle tick, nothing captured.
                if block.is_empty() {
                    continue;
                }
                let pcm = codec::encode_to_pcm16(&block);
                let frame = codec::to_transport(&pcm, CAPTURE_SAMPLE_RATE);

                // Gate is read at send time, not pull time.
                if gated.load(Ordering::SeqCst) {
                    continue;
                }

                // A panicking sink costs one frame, never the loop.
                if catch_unwind(AssertUnwindSafe(|| sink(frame))).is_err() {
                    log::error!("Capture sink panicked, frame dropped");
                }
            }
            Err(e) => {
                log::error!("Capture pull failed: {}", e);
                exit_error = Some(e);
                break;
            }
        }
    }

    handle.release();
    log::info!("Capture stopped");

    if let Some(e) = exit_error {
        on_error(e);
    }
}
