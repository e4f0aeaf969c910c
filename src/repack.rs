//! Encoder-local repacking within one attempt

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::Result;
use crate::config::QP_LIMIT;
use crate::types::FrameControl;

/// Outcome of coding one attempt, repacks included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedFrame {
    /// Size in bytes of the last pass
    pub size: u32,
    /// Repack passes spent after the first pass
    pub repacks: u16,
    /// QP of the last pass
    pub final_qp: i32,
}

impl CodedFrame {
    pub fn single_pass(size: u32, qp: i32) -> Self {
        Self { size, repacks: 0, final_qp: qp }
    }
}

/// Code one attempt under `control`, repacking while the result exceeds
/// `max_frame_size`.
///
/// `pak` codes the frame at the given QP and returns its size in bytes. Pass
/// `n` (counting from zero) after the first runs at
/// `qp_y + delta_qp[0] + … + delta_qp[n]`; repacking stops once the frame fits
/// or `max_num_repak` passes are spent. The rate controller only ever sees the
/// size of the last pass.
pub fn encode_with_repack<F>(control: &FrameControl, mut pak: F) -> Result<CodedFrame>
where
    F: FnMut(i32) -> Result<u32>,
{
    let mut frame = CodedFrame::single_pass(pak(control.qp_y)?, control.qp_y);
    if !control.repack_enabled() {
        return Ok(frame);
    }

    while frame.size > control.max_frame_size {
        let Some(qp) = control.repack_qp(frame.repacks as usize) else {
            break;
        };
        let qp = qp.min(QP_LIMIT);
        trace!(repack = frame.repacks, qp, size = frame.size, limit = control.max_frame_size, "Repacking");
        frame = CodedFrame { size: pak(qp)?, repacks: frame.repacks + 1, final_qp: qp };
    }
    Ok(frame)
}
