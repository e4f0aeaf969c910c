//! Per-attempt frame control produced by the rate controller

use serde::{Deserialize, Serialize};

/// Maximum number of encoder-local repacks a control may request.
pub const MAX_REPAK: usize = 8;

/// Externally supplied initial CPB removal timing.
///
/// Both values are supplied together; a control without timing lets the
/// encoder compute them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpbRemovalTiming {
    /// initial_cpb_removal_delay in 90 kHz ticks
    pub delay: u32,
    /// initial_cpb_removal_offset in 90 kHz ticks
    pub offset: u32,
}

impl CpbRemovalTiming {
    /// Returns `None` for the all-zero pair, which means "encoder computes".
    pub fn new(delay: u32, offset: u32) -> Option<Self> {
        if delay == 0 && offset == 0 { None } else { Some(Self { delay, offset }) }
    }
}

/// Encoding parameters for one coding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameControl {
    /// Frame-level luma QP
    pub qp_y: i32,
    pub cpb_removal: Option<CpbRemovalTiming>,
    /// Byte budget above which the encoder repacks; 0 disables repacking
    pub max_frame_size: u32,
    /// QP increments applied cumulatively on successive repacks
    pub delta_qp: [u8; MAX_REPAK],
    /// Repack bound for this frame, in `0..=8`
    pub max_num_repak: u16,
}

impl FrameControl {
    /// Control with a QP and no repacking or external timing.
    pub fn with_qp(qp_y: i32) -> Self {
        Self {
            qp_y,
            cpb_removal: None,
            max_frame_size: 0,
            delta_qp: [0; MAX_REPAK],
            max_num_repak: 0,
        }
    }

    /// Enable repacking with the given schedule (truncated to [`MAX_REPAK`] entries).
    pub fn with_repack(mut self, max_frame_size: u32, delta_qp: &[u8]) -> Self {
        let count = delta_qp.len().min(MAX_REPAK);
        self.max_frame_size = max_frame_size;
        self.delta_qp = [0; MAX_REPAK];
        self.delta_qp[..count].copy_from_slice(&delta_qp[..count]);
        self.max_num_repak = count as u16;
        self
    }

    pub fn with_cpb_removal(mut self, cpb_removal: Option<CpbRemovalTiming>) -> Self {
        self.cpb_removal = cpb_removal;
        self
    }

    /// Repacking happens only with a byte budget and at least one allowed repack.
    pub fn repack_enabled(&self) -> bool {
        self.max_frame_size != 0 && self.max_num_repak != 0
    }

    /// Canonical form of this control.
    ///
    /// Without a byte budget the repack fields are zeroed, the repack bound is
    /// clamped to [`MAX_REPAK`], and deltas past the bound are cleared.
    pub fn normalized(mut self) -> Self {
        if self.max_frame_size == 0 {
            self.delta_qp = [0; MAX_REPAK];
            self.max_num_repak = 0;
            return self;
        }
        self.max_num_repak = self.max_num_repak.min(MAX_REPAK as u16);
        for delta in self.delta_qp.iter_mut().skip(self.max_num_repak as usize) {
            *delta = 0;
        }
        self
    }

    pub fn is_normalized(&self) -> bool {
        *self == self.normalized()
    }

    /// QP used by the `repack`-th repack (0-based), or `None` past the bound.
    pub fn repack_qp(&self, repack: usize) -> Option<i32> {
        if !self.repack_enabled() || repack >= self.max_num_repak as usize {
            return None;
        }
        let sum: i32 = self.delta_qp[..=repack].iter().map(|&d| i32::from(d)).sum();
        Some(self.qp_y + sum)
    }
}
