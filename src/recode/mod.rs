//! Per-frame recode loop.
//!
//! Drives one frame through the session until a terminal verdict:
//!
//! ```text
//! Proposing ──frame_control──▶ Coding ──encode──▶ Evaluating ──update──┐
//!     ▲                                                                │
//!     └──────────── RecodeTooBig / RecodeTooSmall (num_recode + 1) ◀───┤
//!                                                                      ├──▶ Accepted
//!                                                  PanicTooBig ────────┼──▶ AbandonedSkip
//!                                                  PanicTooSmall ──────┴──▶ AbandonedPad
//! ```
//!
//! The loop owns the hard retry ceiling. Once [`RecodeBudget::max_recode`]
//! recodes are spent, a further recode verdict is turned into the matching panic
//! and reported to the session with [`BrcSession::abandon`].

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::Result;
use crate::config::BrcConfig;
use crate::repack::CodedFrame;
use crate::session::BrcSession;
use crate::types::{BrcStatus, FrameControl, FrameDescriptor};


/// The encoder side of the loop.
pub trait FrameCoder {
    /// Code the attempt in `descriptor` honouring `control`, repacking
    /// internally when the control allows it.
    fn encode(&mut self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<CodedFrame>;

    /// Drop the frame; references must be adjusted by the encoder.
    fn skip(&mut self, descriptor: &FrameDescriptor) -> Result<()> {
        let _ = descriptor;
        Ok(())
    }

    /// Pad the coded frame up to `padded_size` bytes.
    fn pad(&mut self, descriptor: &FrameDescriptor, coded: &CodedFrame, padded_size: u32) -> Result<()> {
        let _ = (descriptor, coded, padded_size);
        Ok(())
    }
}

impl<C: FrameCoder + ?Sized> FrameCoder for Box<C> {
    fn encode(&mut self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<CodedFrame> {
        (**self).encode(descriptor, control)
    }

    fn skip(&mut self, descriptor: &FrameDescriptor) -> Result<()> {
        (**self).skip(descriptor)
    }

    fn pad(&mut self, descriptor: &FrameDescriptor, coded: &CodedFrame, padded_size: u32) -> Result<()> {
        (**self).pad(descriptor, coded, padded_size)
    }
}

/// Recodes allowed per frame before the loop forces a panic verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecodeBudget {
    pub max_recode: u16,
}

impl RecodeBudget {
    pub fn new(max_recode: u16) -> Self {
        Self { max_recode }
    }

    pub fn from_config(config: &BrcConfig) -> Self {
        Self::new(config.max_recode)
    }

    /// Whether attempt `num_recode` may be followed by another attempt.
    pub fn allows_recode_after(&self, num_recode: u16) -> bool {
        num_recode < self.max_recode
    }
}

/// Position of a frame in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Proposing,
    Coding,
    Evaluating,
    Accepted,
    AbandonedPad,
    AbandonedSkip,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Accepted | LoopState::AbandonedPad | LoopState::AbandonedSkip)
    }
}

/// How a frame left the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOutcome {
    Accepted,
    Padded,
    Skipped,
}

impl FrameOutcome {
    fn state(self) -> LoopState {
        match self {
            FrameOutcome::Accepted => LoopState::Accepted,
            FrameOutcome::Padded => LoopState::AbandonedPad,
            FrameOutcome::Skipped => LoopState::AbandonedSkip,
        }
    }
}

/// Summary of one frame's trip through the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    pub encoded_order: u32,
    pub display_order: u32,
    pub outcome: FrameOutcome,
    /// Verdict of every update, in order
    pub verdicts: Vec<BrcStatus>,
    /// Size of the last coded attempt
    pub coded_size: u32,
    /// Bytes the frame occupies in the stream: 0 when skipped, the padded size when padded
    pub final_size: u32,
    pub final_qp: i32,
    /// Repack passes summed over all attempts
    pub repacks: u32,
    /// The loop imposed the final panic after the budget ran out
    pub forced: bool,
}

impl FrameReport {
    /// Number of update calls made for the frame.
    pub fn attempts(&self) -> usize {
        self.verdicts.len()
    }

    pub fn final_state(&self) -> LoopState {
        self.outcome.state()
    }
}

/// Runs frames through a session one at a time.
#[derive(Debug, Clone, Copy)]
pub struct RecodeLoop {
    budget: RecodeBudget,
}

impl RecodeLoop {
    pub fn new(budget: RecodeBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> RecodeBudget {
        self.budget
    }

    /// Encode one frame to a terminal verdict.
    ///
    /// `descriptor` is the first attempt of a new frame. Any error leaves the
    /// frame unfinished; BRC errors are fatal to the encode and are not retried.
    pub fn run_frame<C>(&self, session: &mut BrcSession, coder: &mut C, descriptor: FrameDescriptor) -> Result<FrameReport>
    where
        C: FrameCoder + ?Sized,
    {
        let mut attempt = FrameDescriptor { num_recode: 0, ..descriptor };
        let mut verdicts = Vec::new();
        let mut repacks = 0u32;

        loop {
            trace!(frame = attempt.encoded_order, attempt = attempt.num_recode, state = ?LoopState::Proposing, "Recode loop");
            let control = session.frame_control(&attempt)?;

            trace!(frame = attempt.encoded_order, attempt = attempt.num_recode, qp = control.qp_y, state = ?LoopState::Coding, "Recode loop");
            let coded = coder.encode(&attempt, &control)?;
            repacks += u32::from(coded.repacks);
            let evaluated = attempt.with_coded_size(coded.size);

            trace!(frame = attempt.encoded_order, attempt = attempt.num_recode, size = coded.size, state = ?LoopState::Evaluating, "Recode loop");
            let status = session.update(&evaluated, &control)?;
            verdicts.push(status.verdict);

            let (outcome, final_size, forced) = match status.verdict {
                BrcStatus::Accept => (FrameOutcome::Accepted, coded.size, false),
                BrcStatus::PanicTooBig => {
                    coder.skip(&evaluated)?;
                    (FrameOutcome::Skipped, 0, false)
                }
                BrcStatus::PanicTooSmall => {
                    let padded = status.min_frame_size.max(coded.size);
                    coder.pad(&evaluated, &coded, padded)?;
                    (FrameOutcome::Padded, padded, false)
                }
                BrcStatus::RecodeTooBig | BrcStatus::RecodeTooSmall => {
                    if self.budget.allows_recode_after(evaluated.num_recode) {
                        attempt = evaluated.next_attempt(coded.size);
                        continue;
                    }
                    match status.verdict.forced_panic() {
                        BrcStatus::PanicTooSmall => {
                            let padded = status.min_frame_size.max(coded.size);
                            session.abandon(&evaluated, BrcStatus::PanicTooSmall, padded)?;
                            coder.pad(&evaluated, &coded, padded)?;
                            (FrameOutcome::Padded, padded, true)
                        }
                        forced => {
                            session.abandon(&evaluated, forced, 0)?;
                            coder.skip(&evaluated)?;
                            (FrameOutcome::Skipped, 0, true)
                        }
                    }
                }
            };

            let report = FrameReport {
                encoded_order: evaluated.encoded_order,
                display_order: evaluated.display_order,
                outcome,
                verdicts,
                coded_size: coded.size,
                final_size,
                final_qp: coded.final_qp,
                repacks,
                forced,
            };
            debug!(
                frame = report.encoded_order,
                attempts = report.attempts(),
                outcome = ?report.outcome,
                size = report.final_size,
                qp = report.final_qp,
                forced,
                "Frame finished"
            );
            return Ok(report);
        }
    }
}
