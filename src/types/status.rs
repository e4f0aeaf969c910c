//! Rate-control verdicts returned by update

use serde::{Deserialize, Serialize};

use crate::{BrcError, Operation};

/// Instruction to the encoder after a coding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum BrcStatus {
    /// Coded size is acceptable; proceed to the next frame
    Accept = 0,
    /// Frame too big; recode required
    RecodeTooBig = 1,
    /// Frame too small; recode required
    RecodeTooSmall = 2,
    /// Frame too big and no further recoding possible; skip it
    PanicTooBig = 3,
    /// Frame too small and no further recoding possible; pad it
    PanicTooSmall = 4,
}

impl BrcStatus {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Verdicts that end the frame.
    pub fn is_terminal(self) -> bool {
        !self.is_recode()
    }

    pub fn is_recode(self) -> bool {
        matches!(self, BrcStatus::RecodeTooBig | BrcStatus::RecodeTooSmall)
    }

    pub fn is_panic(self) -> bool {
        matches!(self, BrcStatus::PanicTooBig | BrcStatus::PanicTooSmall)
    }

    /// Terminal verdict in the same direction as a recode verdict.
    pub fn forced_panic(self) -> Self {
        match self {
            BrcStatus::RecodeTooBig => BrcStatus::PanicTooBig,
            BrcStatus::RecodeTooSmall => BrcStatus::PanicTooSmall,
            other => other,
        }
    }
}

impl TryFrom<u16> for BrcStatus {
    type Error = BrcError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(BrcStatus::Accept),
            1 => Ok(BrcStatus::RecodeTooBig),
            2 => Ok(BrcStatus::RecodeTooSmall),
            3 => Ok(BrcStatus::PanicTooBig),
            4 => Ok(BrcStatus::PanicTooSmall),
            other => Err(BrcError::strategy(
                Operation::Update,
                format!("unknown verdict code {}", other),
            )),
        }
    }
}

/// Outcome of [`update`](crate::RateController::update) for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStatus {
    pub verdict: BrcStatus,
    /// Size in bytes the frame must be padded to. Meaningful for the two
    /// too-small verdicts: with [`BrcStatus::RecodeTooSmall`] it is the
    /// padding floor should the recode loop force a panic instead of recoding
    pub min_frame_size: u32,
}

impl FrameStatus {
    pub fn accept() -> Self {
        Self { verdict: BrcStatus::Accept, min_frame_size: 0 }
    }

    pub fn recode_too_big() -> Self {
        Self { verdict: BrcStatus::RecodeTooBig, min_frame_size: 0 }
    }

    pub fn recode_too_small() -> Self {
        Self { verdict: BrcStatus::RecodeTooSmall, min_frame_size: 0 }
    }

    pub fn skip() -> Self {
        Self { verdict: BrcStatus::PanicTooBig, min_frame_size: 0 }
    }

    pub fn pad(min_frame_size: u32) -> Self {
        Self { verdict: BrcStatus::PanicTooSmall, min_frame_size }
    }

    pub fn with_min_frame_size(self, min_frame_size: u32) -> Self {
        Self { min_frame_size, ..self }
    }
}
