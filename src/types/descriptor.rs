//! Per-attempt frame descriptor

use serde::{Deserialize, Serialize};

use super::FrameType;

/// Optional hints available in extended encoder profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameHints {
    /// Frame belongs to a new scene
    pub scene_change: bool,
    /// Frame is a long-term reference
    pub long_term: bool,
    /// Spatial complexity score, 0 when not available
    pub complexity: u32,
}

/// Identifies one coding attempt of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptKey {
    pub encoded_order: u32,
    pub num_recode: u16,
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame {} attempt {}", self.encoded_order, self.num_recode)
    }
}

/// Frame metadata handed to the rate controller for one coding attempt.
///
/// The recode loop owns descriptors; rate controllers only borrow them for
/// the duration of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    /// Frame number in encode order, counted from session init
    pub encoded_order: u32,
    /// Frame number in display order, counted from the last refresh point
    pub display_order: u32,
    /// Size in bytes of the most recent attempt (0 before the first)
    pub coded_frame_size: u32,
    pub frame_type: FrameType,
    /// Hierarchy depth in a layered reference structure
    pub pyramid_layer: u16,
    /// Attempts already performed for this frame
    pub num_recode: u16,
    pub hints: Option<FrameHints>,
}

impl FrameDescriptor {
    /// Descriptor for the first attempt at a frame.
    pub fn new(encoded_order: u32, display_order: u32, frame_type: FrameType) -> Self {
        Self {
            encoded_order,
            display_order,
            coded_frame_size: 0,
            frame_type,
            pyramid_layer: 0,
            num_recode: 0,
            hints: None,
        }
    }

    pub fn with_pyramid_layer(mut self, pyramid_layer: u16) -> Self {
        self.pyramid_layer = pyramid_layer;
        self
    }

    pub fn with_hints(mut self, hints: FrameHints) -> Self {
        self.hints = Some(hints);
        self
    }

    /// Descriptor for the attempt that follows this one.
    pub fn next_attempt(&self, coded_frame_size: u32) -> Self {
        Self { coded_frame_size, num_recode: self.num_recode.saturating_add(1), ..*self }
    }

    /// Same attempt with the measured coded size filled in.
    pub fn with_coded_size(&self, coded_frame_size: u32) -> Self {
        Self { coded_frame_size, ..*self }
    }

    pub fn attempt_key(&self) -> AttemptKey {
        AttemptKey { encoded_order: self.encoded_order, num_recode: self.num_recode }
    }

    pub fn is_scene_change(&self) -> bool {
        self.hints.is_some_and(|h| h.scene_change)
    }

    pub fn complexity(&self) -> Option<u32> {
        self.hints.map(|h| h.complexity).filter(|&c| c != 0)
    }
}
