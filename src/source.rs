//! Frame source trait for the encode driver

use std::collections::VecDeque;
use std::time::Duration;

use crate::Result;
use crate::types::FrameDescriptor;

/// Trait for sources of frames to encode
///
/// Sources abstract over where frames come from (a capture pipeline, a file
/// reader, a synthetic generator) and handle their own pacing internally.
#[async_trait::async_trait]
pub trait FrameSource: Send + 'static {
    /// Get the next frame in encode order
    ///
    /// Returns:
    /// - `Ok(Some(descriptor))` - Frame ready to encode (attempt 0)
    /// - `Ok(None)` - Stream ended (normal termination)
    /// - `Err(e)` - Error occurred; the driver retries with backoff
    async fn next_frame(&mut self) -> Result<Option<FrameDescriptor>>;

    /// Nominal frame rate of the source in Hz
    fn frame_rate(&self) -> f64;
}

/// Source yielding a prepared list of frames, optionally paced.
#[derive(Debug, Clone)]
pub struct QueuedSource {
    frames: VecDeque<FrameDescriptor>,
    interval: Option<Duration>,
    frame_rate: f64,
}

impl QueuedSource {
    /// Frames are yielded back to back.
    pub fn new(frames: impl IntoIterator<Item = FrameDescriptor>, frame_rate: f64) -> Self {
        Self { frames: frames.into_iter().collect(), interval: None, frame_rate }
    }

    /// Wait one frame interval before yielding each frame.
    pub fn paced(mut self) -> Self {
        if self.frame_rate > 0.0 {
            self.interval = Some(Duration::from_secs_f64(1.0 / self.frame_rate));
        }
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait::async_trait]
impl FrameSource for QueuedSource {
    async fn next_frame(&mut self) -> Result<Option<FrameDescriptor>> {
        if let Some(interval) = self.interval {
            tokio::time::sleep(interval).await;
        }
        Ok(self.frames.pop_front())
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameType;

    #[tokio::test]
    async fn queued_source_drains_in_order() {
        let frames = (0..3).map(|i| FrameDescriptor::new(i, i, FrameType::predicted()));
        let mut source = QueuedSource::new(frames, 1_000.0).paced();
        assert_eq!(source.remaining(), 3);
        assert_eq!(source.frame_rate(), 1_000.0);

        let first = source.next_frame().await.unwrap().expect("frame 0");
        assert_eq!(first.encoded_order, 0);
        assert_eq!(source.remaining(), 2);

        while source.next_frame().await.unwrap().is_some() {}
        assert_eq!(source.remaining(), 0);
        assert!(source.next_frame().await.unwrap().is_none());
    }
}
