//! Remote-audio playback: transport frames → gapless scheduled output.
//!
//! Frames arrive in bursts on network timing; the scheduler places each
//! one on the output-device clock so rendering is continuous. One cursor
//! tracks the end of scheduled audio: a frame starts at the cursor when
//! the stream is ahead of the clock, or immediately when it has fallen
//! behind.

use std::sync::Arc;

use crate::audio::{OutputDevice, OutputHandle};
use crate::codec::{self, TransportFrame, PLAYBACK_SAMPLE_RATE};
use crate::error::AudioError;

/// Owns the output-device session and the scheduling cursor.
pub struct PlaybackScheduler {
    device: Arc<dyn OutputDevice>,
    out: Option<Box<dyn OutputHandle>>,
    cursor: f64,
}

impl PlaybackScheduler {
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self {
            device,
            out: None,
            cursor: 0.0,
        }
    }

    /// Open the output session and anchor the cursor at the device clock.
    /// A second call while already open is a no-op.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.out.is_some() {
            return Ok(());
        }
        let out = self.device.open(PLAYBACK_SAMPLE_RATE)?;
        self.cursor = out.clock_now();
        log::info!(
            "Playback started: rate={}Hz, clock={:.3}s",
            PLAYBACK_SAMPLE_RATE,
            self.cursor
        );
        self.out = Some(out);
        Ok(())
    }

    /// Decode one frame and schedule it after everything already queued.
    ///
    /// Start time is `max(cursor, clock_now())`; the cursor advances by
    /// the frame's duration. Decode failures leave the cursor and the
    /// queue untouched.
    pub fn enqueue(&mut self, frame: &TransportFrame) -> Result<(), AudioError> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| AudioError::unknown("playback not started"))?;

        if let Some(rate) = codec::rate_from_mime(&frame.mime_type) {
            if rate != PLAYBACK_SAMPLE_RATE {
                log::warn!("Inbound frame tagged {}Hz, rendering at {}Hz", rate, PLAYBACK_SAMPLE_RATE);
            }
        }

        let pcm = codec::from_transport(frame)?;
        let samples = codec::decode_from_pcm16(&pcm)?;
        if samples.is_empty() {
            return Ok(());
        }

        let duration = samples.len() as f64 / PLAYBACK_SAMPLE_RATE as f64;
        let start = self.cursor.max(out.clock_now());
        out.schedule(samples, start)?;
        self.cursor = start + duration;
        Ok(())
    }

    /// Drop everything scheduled but not yet rendered and snap the cursor
    /// to the clock, so the next enqueue starts immediately.
    pub fn flush(&mut self) {
        if let Some(out) = self.out.as_mut() {
            out.flush();
            self.cursor = out.clock_now();
            log::info!("Playback flushed, cursor={:.3}s", self.cursor);
        }
    }

    /// Release the output session, discarding pending audio. Idempotent.
    pub fn stop(&mut self) {
        if let Some(out) = self.out.take() {
            out.release();
            log::info!("Playback stopped");
        }
    }

    /// End of scheduled audio on the device clock, in seconds.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn is_started(&self) -> bool {
        self.out.is_some()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
