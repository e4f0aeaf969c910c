//! Frame type word and coarse frame classes

use serde::{Deserialize, Serialize};

use super::frame_flags;

/// Frame type flag word (see [`frame_flags`](super::frame_flags)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FrameType(pub u16);

impl FrameType {
    /// Create a new FrameType from a raw flag word.
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Instantaneous decoder refresh: an intra reference frame starting a new sequence.
    pub fn idr() -> Self {
        Self(frame_flags::I | frame_flags::REF | frame_flags::IDR)
    }

    /// Intra reference frame that is not a refresh point.
    pub fn intra() -> Self {
        Self(frame_flags::I | frame_flags::REF)
    }

    /// Predicted reference frame.
    pub fn predicted() -> Self {
        Self(frame_flags::P | frame_flags::REF)
    }

    /// Non-reference bidirectionally predicted frame.
    pub fn bidirectional() -> Self {
        Self(frame_flags::B)
    }

    /// Same frame type with the reference flag set.
    pub fn with_reference(self) -> Self {
        Self(self.0 | frame_flags::REF)
    }

    /// Check if a specific flag is set using a bitmask.
    pub fn has_flag(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_idr(&self) -> bool {
        self.has_flag(frame_flags::IDR)
    }

    pub fn is_reference(&self) -> bool {
        self.has_flag(frame_flags::REF)
    }

    /// Coarse coding class, or `None` when no coding flag is set.
    ///
    /// When several coding flags are present the most independent one wins
    /// (I before P before B).
    pub fn class(&self) -> Option<FrameClass> {
        if self.has_flag(frame_flags::I) {
            Some(FrameClass::Intra)
        } else if self.has_flag(frame_flags::P) {
            Some(FrameClass::Predicted)
        } else if self.has_flag(frame_flags::B) {
            Some(FrameClass::Bidirectional)
        } else {
            None
        }
    }

    /// Get the raw flag word.
    pub fn value(&self) -> u16 {
        self.0
    }
}

/// Coding class used for per-class rate-control statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameClass {
    Intra,
    Predicted,
    Bidirectional,
}

impl FrameClass {
    pub const ALL: [FrameClass; 3] =
        [FrameClass::Intra, FrameClass::Predicted, FrameClass::Bidirectional];

    /// Stable index for per-class tables.
    pub const fn index(self) -> usize {
        match self {
            FrameClass::Intra => 0,
            FrameClass::Predicted => 1,
            FrameClass::Bidirectional => 2,
        }
    }
}
