//! Audio side of the voice session: resampling, wire codec, microphone
//! capture and gapless playback.
//!
//! Hardware is reached through the `AudioBackend` trait so the session
//! manager can be driven by the real cpal/rodio devices or by test fakes.

pub mod capture;
pub mod codec;
pub mod playback;
pub mod resample;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::SessionError;

pub use capture::{
    list_devices, list_output_devices, BlockEncoder, CaptureConstraints, CapturePipeline,
    CpalBackend, CAPTURE_BLOCK_SAMPLES,
};
pub use codec::{decode_frame, encode_frame, CodecError, InboundFrame, OutboundFrame};
pub use playback::{PlaybackBuffer, PlaybackScheduler, PlaybackTimeline, ScheduledPlayback};
pub use resample::resample;

/// Callback receiving mono sample blocks from the device thread.
pub type BlockSink = Box<dyn FnMut(&[f32]) + Send>;

/// An acquired microphone. Holding one keeps the hardware open.
pub trait InputDevice: Send {
    /// Native capture rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Start delivering mono blocks to `sink`. Replaces any previous sink.
    fn attach(&mut self, sink: BlockSink) -> Result<(), SessionError>;

    /// Stop delivery and release the hardware. Idempotent.
    fn release(&mut self);
}

/// An open output device rendering a `PlaybackTimeline`.
pub trait OutputDevice: Send {
    /// Stop rendering and release the hardware. Idempotent.
    fn close(&mut self);
}

/// Factory for audio hardware handles (dyn-compatible).
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone. May wait on an OS permission prompt.
    fn acquire_input(
        &self,
        constraints: CaptureConstraints,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn InputDevice>, SessionError>> + Send + '_>>;

    /// Open the output device and start rendering `timeline`.
    fn open_output(
        &self,
        timeline: Arc<PlaybackTimeline>,
    ) -> Result<Box<dyn OutputDevice>, SessionError>;
}
