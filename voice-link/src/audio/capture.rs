//! Microphone capture via cpal.
//!
//! The input device is opened at its native rate and down-mixed to mono in
//! the cpal callback. Once the session is live a `CapturePipeline` attaches a
//! block sink that gathers 4096-sample blocks, resamples them to 16 kHz,
//! encodes them and hands them to the transport queue without blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;

use super::codec::{encode_frame, silence_frame, OutboundFrame, OUTBOUND_SAMPLE_RATE};
use super::playback::{PlaybackTimeline, RodioOutput};
use super::resample::{downmix_to_mono, resample};
use super::{AudioBackend, BlockSink, InputDevice, OutputDevice};

/// Samples per capture block at the device rate.
pub const CAPTURE_BLOCK_SAMPLES: usize = 4096;

/// List available input device names.
pub fn list_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// List available output device names.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.output_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// What we ask of the microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Channels delivered to the pipeline. Always 1; wider devices are down-mixed.
    pub channels: u16,
    /// Named input device, or `None` for the system default.
    pub device_name: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channels: 1,
            device_name: None,
        }
    }
}

/// Map a device error message onto the failure taxonomy.
///
/// Backends report permission problems only as text, so this looks for the
/// usual wording.
pub(crate) fn classify_device_error(message: String) -> SessionError {
    let lower = message.to_lowercase();
    if ["permission", "denied", "not allowed", "not authorized"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        SessionError::PermissionDenied(message)
    } else {
        SessionError::CapabilityMissing(message)
    }
}

// ── Block encoding ──────────────────────────────────────────────────

/// Gathers device samples into fixed blocks and encodes each one.
pub struct BlockEncoder {
    native_rate: u32,
    pending: Vec<f32>,
}

impl BlockEncoder {
    pub fn new(native_rate: u32) -> Self {
        Self {
            native_rate,
            pending: Vec::with_capacity(CAPTURE_BLOCK_SAMPLES * 2),
        }
    }

    /// Append mono samples; emit one frame per completed block.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(OutboundFrame)) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= CAPTURE_BLOCK_SAMPLES {
            let block: Vec<f32> = self.pending.drain(..CAPTURE_BLOCK_SAMPLES).collect();
            let resampled = resample(&block, self.native_rate, OUTBOUND_SAMPLE_RATE);
            emit(encode_frame(&resampled));
        }
    }
}

/// Non-blocking hand-off to the transport queue.
fn forward_frame(tx: &mpsc::Sender<OutboundFrame>, frame: OutboundFrame, dropped: &AtomicU64) {
    match tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n % 50 == 0 {
                warn!(dropped = n, "Outbound queue full, dropping capture frame");
            }
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Outbound queue closed, dropping capture frame");
        }
    }
}

/// Running capture: microphone -> resample -> encode -> transport queue.
pub struct CapturePipeline {
    input: Box<dyn InputDevice>,
    outbound: mpsc::Sender<OutboundFrame>,
    dropped: Arc<AtomicU64>,
    stopped: bool,
}

impl CapturePipeline {
    /// Attach to an acquired microphone and start streaming into `outbound`.
    pub fn start(
        mut input: Box<dyn InputDevice>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Result<Self, SessionError> {
        let native_rate = input.sample_rate();
        let mut encoder = BlockEncoder::new(native_rate);
        let tx = outbound.clone();
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_cb = Arc::clone(&dropped);

        input.attach(Box::new(move |samples: &[f32]| {
            encoder.push(samples, |frame| forward_frame(&tx, frame, &dropped_cb));
        }))?;

        info!(native_rate, target_rate = OUTBOUND_SAMPLE_RATE, "Capture pipeline started");
        Ok(Self {
            input,
            outbound,
            dropped,
            stopped: false,
        })
    }

    /// Queue `duration_ms` of silence. Some services only start their first
    /// turn after hearing audio.
    pub fn send_initial_silence(&self, duration_ms: u32) {
        debug!(duration_ms, "Sending initial silence frame");
        forward_frame(&self.outbound, silence_frame(duration_ms), &self.dropped);
    }

    /// Frames dropped because the transport queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Detach from the device and release the microphone.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.input.release();
        info!(dropped = self.dropped_frames(), "Capture pipeline stopped");
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── cpal backend ────────────────────────────────────────────────────

/// Wrapper to make `cpal::Stream` Send.
///
/// `cpal::Stream` is `!Send` on some platforms due to internal raw pointers,
/// but we only hold it alive and drop it. The callback runs on cpal's own
/// audio thread.
struct SendStream(#[allow(dead_code)] Stream);

// SAFETY: the stream is never accessed from another thread, only dropped.
unsafe impl Send for SendStream {}

type SinkSlot = Arc<Mutex<Option<BlockSink>>>;

/// A live cpal input stream. Samples are discarded until a sink is attached.
struct CpalInput {
    stream: Option<SendStream>,
    sink: SinkSlot,
    native_rate: u32,
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.native_rate
    }

    fn attach(&mut self, sink: BlockSink) -> Result<(), SessionError> {
        if self.stream.is_none() {
            return Err(SessionError::CapabilityMissing(
                "Input stream already released".into(),
            ));
        }
        match self.sink.lock() {
            Ok(mut guard) => {
                *guard = Some(sink);
                Ok(())
            }
            Err(e) => Err(SessionError::CapabilityMissing(format!(
                "Input sink unavailable: {}",
                e
            ))),
        }
    }

    fn release(&mut self) {
        if let Ok(mut guard) = self.sink.lock() {
            guard.take();
        }
        if self.stream.take().is_some() {
            info!("Microphone released");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.release();
    }
}

/// Find the input device and open a running stream on it.
fn open_input(constraints: &CaptureConstraints) -> Result<CpalInput, SessionError> {
    let host = cpal::default_host();

    let device = if let Some(name) = constraints.device_name.as_deref() {
        host.input_devices()
            .map_err(|e| classify_device_error(format!("Failed to enumerate input devices: {e}")))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| SessionError::CapabilityMissing(format!("Input device not found: {name}")))?
    } else {
        host.default_input_device().ok_or_else(|| {
            SessionError::CapabilityMissing("No default input device available".to_string())
        })?
    };

    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
    info!(device = %dev_name, "Selected input device");

    let default_config = device
        .default_input_config()
        .map_err(|e| classify_device_error(format!("Failed to get default input config: {e}")))?;

    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();
    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    // cpal exposes no voice processing switches; the OS input chain applies
    // whatever the device is configured for.
    debug!(
        echo_cancellation = constraints.echo_cancellation,
        noise_suppression = constraints.noise_suppression,
        auto_gain_control = constraints.auto_gain_control,
        "Requested voice processing"
    );
    info!(native_rate, channels, "Input device config (down-mixed to mono)");

    let sink: SinkSlot = Arc::new(Mutex::new(None));
    let cb_sink = Arc::clone(&sink);

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = downmix_to_mono(data, channels);
                // Never wait on the lock from the audio thread.
                if let Ok(mut guard) = cb_sink.try_lock() {
                    if let Some(sink) = guard.as_mut() {
                        sink(&mono);
                    }
                }
            },
            move |err| {
                error!("Audio input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| classify_device_error(format!("Failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| classify_device_error(format!("Failed to start input stream: {e}")))?;

    info!("Microphone acquired");
    Ok(CpalInput {
        stream: Some(SendStream(stream)),
        sink,
        native_rate,
    })
}

/// Real hardware: cpal for the microphone, rodio for the speaker.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn acquire_input(
        &self,
        constraints: CaptureConstraints,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Box<dyn InputDevice>, SessionError>> + Send + '_>,
    > {
        Box::pin(async move {
            let input = tokio::task::spawn_blocking(move || open_input(&constraints))
                .await
                .map_err(|e| SessionError::CapabilityMissing(format!("Input task failed: {}", e)))??;
            Ok(Box::new(input) as Box<dyn InputDevice>)
        })
    }

    fn open_output(
        &self,
        timeline: Arc<PlaybackTimeline>,
    ) -> Result<Box<dyn OutputDevice>, SessionError> {
        RodioOutput::open(timeline).map(|out| Box::new(out) as Box<dyn OutputDevice>)
    }
}
