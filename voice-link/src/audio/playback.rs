//! Gapless playback of synthesized speech.
//!
//! `PlaybackTimeline` is the output timeline: its clock is the number of
//! frames already rendered to the output device, and it owns the live set
//! of scheduled voices. `PlaybackScheduler` decides where each arriving
//! buffer starts on that timeline. `RodioOutput` feeds the timeline to the
//! default output device through rodio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rodio::{OutputStream, Source};
use tracing::{debug, error, info, warn};

use crate::error::SessionError;

use super::OutputDevice;

/// Frames rendered per pull from rodio (20 ms at 24 kHz).
const RENDER_CHUNK_FRAMES: usize = 480;

/// A decoded block of speech owned by the timeline until it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    /// Interleaved samples.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Where a buffer landed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: u64,
    /// Start time in seconds on the output clock.
    pub start_at: f64,
    pub duration: f64,
}

/// A buffer placed on the timeline, mono at the timeline rate.
struct Voice {
    id: u64,
    start: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

#[derive(Default)]
struct TimelineState {
    /// Frames rendered so far.
    clock: u64,
    voices: Vec<Voice>,
    next_id: u64,
}

type DrainedHook = Box<dyn Fn() + Send + Sync>;

/// Shared output timeline. Rendered by the device thread, written by the
/// scheduler.
pub struct PlaybackTimeline {
    sample_rate: u32,
    state: Mutex<TimelineState>,
    on_drained: Mutex<Option<DrainedHook>>,
}

impl PlaybackTimeline {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            state: Mutex::new(TimelineState::default()),
            on_drained: Mutex::new(None),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Install a hook fired whenever the last live voice finishes naturally.
    pub fn set_drained_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        match self.on_drained.lock() {
            Ok(mut guard) => *guard = Some(Box::new(hook)),
            Err(e) => error!("Failed to lock drained hook: {}", e),
        }
    }

    /// Current output clock in frames.
    pub fn now_frames(&self) -> u64 {
        self.lock_state().map(|s| s.clock).unwrap_or(0)
    }

    /// Current output clock in seconds.
    pub fn now(&self) -> f64 {
        self.now_frames() as f64 / self.sample_rate as f64
    }

    /// Number of voices scheduled or playing.
    pub fn live_count(&self) -> usize {
        self.lock_state().map(|s| s.voices.len()).unwrap_or(0)
    }

    /// Render the next `out.len()` mono frames and advance the clock.
    ///
    /// Voices that end inside this window are removed from the live set.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let drained = {
            let Some(mut state) = self.lock_state() else {
                return;
            };
            let from = state.clock;
            let to = from + out.len() as u64;

            for voice in &state.voices {
                let begin = voice.start.max(from);
                let end = voice.end().min(to);
                for frame in begin..end {
                    out[(frame - from) as usize] += voice.samples[(frame - voice.start) as usize];
                }
            }

            let had_voices = !state.voices.is_empty();
            state.voices.retain(|v| v.end() > to);
            state.clock = to;
            had_voices && state.voices.is_empty()
        };

        if drained {
            self.fire_drained();
        }
    }

    /// Place a voice at `earliest`, or at the current clock if that has
    /// already passed. Clock read and insertion share one lock so a render
    /// in between cannot clip the head of the voice. Returns (id, start).
    fn insert_at_or_after(&self, earliest: u64, samples: Vec<f32>) -> (u64, u64) {
        let Some(mut state) = self.lock_state() else {
            return (0, earliest);
        };
        let start = earliest.max(state.clock);
        state.next_id += 1;
        let id = state.next_id;
        state.voices.push(Voice { id, start, samples });
        (id, start)
    }

    /// Stop every live voice immediately. Returns how many were cut off.
    fn stop_all(&self) -> usize {
        let Some(mut state) = self.lock_state() else {
            return 0;
        };
        let stopped = state.voices.len();
        if stopped > 0 {
            debug!(
                ids = ?state.voices.iter().map(|v| v.id).collect::<Vec<_>>(),
                "Stopping live voices"
            );
        }
        state.voices.clear();
        stopped
    }

    fn fire_drained(&self) {
        if let Ok(guard) = self.on_drained.lock() {
            if let Some(hook) = guard.as_ref() {
                hook();
            }
        }
    }

    fn lock_state(&self) -> Option<std::sync::MutexGuard<'_, TimelineState>> {
        match self.state.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("Failed to lock playback timeline: {}", e);
                None
            }
        }
    }
}

/// Places arriving buffers back to back on the timeline.
pub struct PlaybackScheduler {
    timeline: Arc<PlaybackTimeline>,
    /// Frame at which the next buffer may start. 0 means "as soon as possible".
    next_start: u64,
}

impl PlaybackScheduler {
    pub fn new(timeline: Arc<PlaybackTimeline>) -> Self {
        Self {
            timeline,
            next_start: 0,
        }
    }

    /// Whether any scheduled buffer is still waiting or playing.
    pub fn is_playing(&self) -> bool {
        self.timeline.live_count() > 0
    }

    /// Next start time in seconds.
    pub fn next_start_time(&self) -> f64 {
        self.next_start as f64 / self.timeline.sample_rate() as f64
    }

    /// Schedule `buffer` to start when the previous one ends, or now if the
    /// previous one has already finished.
    pub fn schedule(&mut self, buffer: PlaybackBuffer) -> ScheduledPlayback {
        let rate = self.timeline.sample_rate();
        if buffer.sample_rate != rate {
            warn!(
                buffer_rate = buffer.sample_rate,
                timeline_rate = rate,
                "Playback buffer rate differs from output timeline"
            );
        }

        let samples = super::resample::downmix_to_mono(&buffer.samples, buffer.channels);
        let frames = samples.len() as u64;
        let (id, start) = self.timeline.insert_at_or_after(self.next_start, samples);
        self.next_start = start + frames;

        ScheduledPlayback {
            id,
            start_at: start as f64 / rate as f64,
            duration: frames as f64 / rate as f64,
        }
    }

    /// Barge-in: cut off everything and forget the stale timeline position.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.timeline.stop_all();
        self.next_start = 0;
        stopped
    }
}

// ── Output device ───────────────────────────────────────────────────

/// Endless rodio source pulling rendered frames from the timeline.
struct TimelineSource {
    timeline: Arc<PlaybackTimeline>,
    chunk: Vec<f32>,
    pos: usize,
    closed: Arc<AtomicBool>,
}

impl Iterator for TimelineSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        if self.pos >= self.chunk.len() {
            self.timeline.render(&mut self.chunk);
            self.pos = 0;
        }
        let sample = self.chunk[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for TimelineSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.timeline.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Wrapper to make `rodio::OutputStream` Send.
///
/// The stream is only kept alive and dropped; rodio drives it from its own
/// audio thread.
struct SendOutputStream(#[allow(dead_code)] OutputStream);

// SAFETY: the stream is never accessed after construction, only dropped.
unsafe impl Send for SendOutputStream {}

/// Default output device playing a `PlaybackTimeline`.
pub struct RodioOutput {
    stream: Option<SendOutputStream>,
    closed: Arc<AtomicBool>,
}

impl RodioOutput {
    /// Open the default output device and start rendering `timeline`.
    pub fn open(timeline: Arc<PlaybackTimeline>) -> Result<Self, SessionError> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| SessionError::CapabilityMissing(format!("No audio output: {}", e)))?;

        let closed = Arc::new(AtomicBool::new(false));
        let source = TimelineSource {
            chunk: vec![0.0; RENDER_CHUNK_FRAMES],
            pos: RENDER_CHUNK_FRAMES,
            timeline: Arc::clone(&timeline),
            closed: Arc::clone(&closed),
        };
        handle
            .play_raw(source)
            .map_err(|e| SessionError::CapabilityMissing(format!("Failed to start output: {}", e)))?;

        info!(sample_rate = timeline.sample_rate(), "Audio output started");
        Ok(Self {
            stream: Some(SendOutputStream(stream)),
            closed,
        })
    }
}

impl OutputDevice for RodioOutput {
    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        if self.stream.take().is_some() {
            info!("Audio output closed");
        }
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.close();
    }
}
