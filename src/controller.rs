//! Rate controller trait

use crate::Result;
use crate::config::{BrcConfig, ConfigChange};
use crate::types::{BrcStatus, FrameControl, FrameDescriptor, FrameStatus};

/// A rate-control capability driven by the encoder.
///
/// Implementations hold the rate-control history of one encode. The session
/// guarantees call ordering, so an implementation never sees `frame_control`
/// or `update` before `init`, after `close`, or out of attempt order. None of
/// the methods may block on I/O; each is expected to finish within a small,
/// bounded amount of CPU time.
pub trait RateController: Send + 'static {
    /// Build rate-control state from a validated configuration.
    ///
    /// Returns [`BrcError::Unsupported`](crate::BrcError::Unsupported) when this
    /// controller cannot realize the configuration.
    fn init(&mut self, config: &BrcConfig) -> Result<()>;

    /// Apply a new configuration between frames.
    ///
    /// `change` is the session's classification of the difference; statistics
    /// should survive everything short of [`ConfigChange::Structural`].
    fn reset(&mut self, config: &BrcConfig, change: ConfigChange) -> Result<()>;

    /// Release internal state.
    fn close(&mut self);

    /// Controls for the attempt described by `descriptor`.
    ///
    /// Takes `&self`: repeated calls for the same attempt return the same
    /// control and never change rate-control state.
    fn frame_control(&self, descriptor: &FrameDescriptor) -> Result<FrameControl>;

    /// Account for the coded size of an attempt and return the verdict.
    ///
    /// `descriptor.coded_frame_size` holds the size of the attempt being evaluated.
    fn update(&mut self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<FrameStatus>;

    /// The recode loop overrode a recode verdict with `verdict` because its
    /// retry budget ran out. Controllers that kept the frame open should
    /// account for it as skipped or padded now.
    fn abandon_frame(&mut self, descriptor: &FrameDescriptor, verdict: BrcStatus, padded_size: u32) -> Result<()> {
        let _ = (descriptor, verdict, padded_size);
        Ok(())
    }

    /// Short name used in logs
    fn name(&self) -> &str {
        "external"
    }
}
