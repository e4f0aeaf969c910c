//! Built-in rate controller.
//!
//! A leaky-bucket CPB model drives the verdicts and a per-class rate/quantizer
//! model picks QPs:
//! - each frame class (I/P/B) gets a share of the GOP's bit budget, scaled by how
//!   far the buffer sits from its initial fullness
//! - an accepted frame moves its class QP by `6·log2(actual/target)`, at most
//!   three steps at a time
//! - a frame that would underflow the buffer (or exceed the configured max frame
//!   size) is recoded at a higher QP while the recode budget and QP range allow,
//!   and skipped otherwise
//! - in CBR, a frame that would let the buffer overflow is recoded at a lower QP,
//!   or padded to the smallest size that keeps the buffer within bounds; both
//!   verdicts carry that size so a recode loop that gives up early can pad
//!
//! Constant-QP sessions return the configured QPs and accept every frame.

mod hrd;
mod qp_model;

pub use hrd::{BufferCheck, HrdBuffer};
pub use qp_model::{ClassTargets, QpModel};

use tracing::{debug, trace};

use crate::config::{BrcConfig, ConfigChange, RateControlMethod};
use crate::controller::RateController;
use crate::types::{
    AttemptKey, BrcStatus, CpbRemovalTiming, FrameClass, FrameControl, FrameDescriptor,
    FrameStatus,
};
use crate::{BrcError, Operation, Result};

/// 90 kHz clock used by CPB removal timing.
const CPB_CLOCK_HZ: f64 = 90_000.0;

/// Point-in-time view of the built-in controller's statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuiltinSnapshot {
    /// CPB fullness in bits, `None` for constant QP
    pub fullness_bits: Option<f64>,
    /// Base QP per class in [`FrameClass::index`] order
    pub class_qp: [i32; 3],
    pub frames: u64,
    pub bits: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingRecode {
    next: AttemptKey,
    qp: i32,
}

#[derive(Debug, Clone)]
struct BuiltinState {
    config: BrcConfig,
    hrd: Option<HrdBuffer>,
    qp: QpModel,
    targets: ClassTargets,
    pending: Option<PendingRecode>,
    frames: u64,
    bits: f64,
}

impl BuiltinState {
    fn new(config: &BrcConfig) -> Self {
        let model = config.buffer_model();
        let hrd = config
            .uses_buffer_model()
            .then(|| HrdBuffer::new(model, config.method == RateControlMethod::Cbr));
        Self {
            config: config.clone(),
            hrd,
            qp: QpModel::new(&config.qp),
            targets: ClassTargets::new(&config.gop, model.bits_per_frame),
            pending: None,
            frames: 0,
            bits: 0.0,
        }
    }

    fn class_of(descriptor: &FrameDescriptor, operation: Operation) -> Result<FrameClass> {
        descriptor.frame_type.class().ok_or_else(|| {
            BrcError::strategy(
                operation,
                format!("frame type {:#06x} has no coding class", descriptor.frame_type.value()),
            )
        })
    }

    fn layer_offset(descriptor: &FrameDescriptor) -> i32 {
        let long_term = descriptor.hints.is_some_and(|h| h.long_term);
        i32::from(descriptor.pyramid_layer) - i32::from(long_term)
    }

    fn target_bits(&self, class: FrameClass) -> f64 {
        let surplus = self.hrd.as_ref().map_or(0.0, HrdBuffer::surplus_ratio);
        self.targets.target(class, surplus)
    }

    fn cpb_removal(&self) -> Option<CpbRemovalTiming> {
        if !self.config.hrd.supply_cpb_timing {
            return None;
        }
        let hrd = self.hrd.as_ref()?;
        let rate = self.config.peak_kbps() as f64 * 1000.0;
        let delay = (hrd.fullness() / rate * CPB_CLOCK_HZ).round() as u32;
        CpbRemovalTiming::new(delay, 0)
    }

    fn frame_control(&self, descriptor: &FrameDescriptor) -> Result<FrameControl> {
        let class = Self::class_of(descriptor, Operation::FrameControl)?;

        let qp = match self.config.method {
            RateControlMethod::Cqp => match class {
                FrameClass::Intra => self.config.qp.i,
                FrameClass::Predicted => self.config.qp.p,
                FrameClass::Bidirectional => self.config.qp.b,
            },
            _ => match self.pending {
                Some(pending) if pending.next == descriptor.attempt_key() => pending.qp,
                _ => self.qp.qp_for(class, Self::layer_offset(descriptor), descriptor.is_scene_change()),
            },
        };

        let schedule = self.config.repack.schedule();
        let control = FrameControl::with_qp(qp)
            .with_repack(self.config.repack.max_frame_size, &schedule)
            .with_cpb_removal(self.cpb_removal());
        Ok(control)
    }

    fn update(&mut self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<FrameStatus> {
        let class = Self::class_of(descriptor, Operation::Update)?;
        let bytes = descriptor.coded_frame_size;
        let bits = bytes as f64 * 8.0;
        let qp_used = control.qp_y;

        if self.config.method == RateControlMethod::Cqp {
            self.finish(bits);
            return Ok(FrameStatus::accept());
        }

        let target = self.target_bits(class);
        let can_recode = descriptor.num_recode < self.config.max_recode;

        let max_frame_bits = self.config.repack.max_frame_size as f64 * 8.0;
        let over_cap = max_frame_bits > 0.0 && bits > max_frame_bits;

        let check = match &self.hrd {
            Some(hrd) if self.config.hrd.conformance => hrd.check(bits),
            _ => BufferCheck::Fits,
        };

        let underflow_allowed = match check {
            BufferCheck::Underflow { excess_bits } => Some(bits - excess_bits),
            _ => None,
        };
        let allowed = match (underflow_allowed, over_cap.then_some(max_frame_bits)) {
            (Some(hrd), Some(cap)) => Some(hrd.min(cap)),
            (hrd, cap) => hrd.or(cap),
        };

        let status = if let Some(allowed) = allowed {
            if can_recode && !self.qp.at_max(qp_used) {
                let qp = self.qp.recode_qp(qp_used, bits / allowed.max(1.0));
                self.pending = Some(PendingRecode { next: descriptor.next_attempt(bytes).attempt_key(), qp });
                FrameStatus::recode_too_big()
            } else {
                self.finish(0.0);
                FrameStatus::skip()
            }
        } else if let BufferCheck::Overflow { missing_bits } = check {
            let needed = bits + missing_bits;
            let min_frame_size = (needed / 8.0).ceil() as u32;
            if can_recode && !self.qp.at_min(qp_used) {
                let qp = self.qp.recode_qp(qp_used, bits.max(1.0) / needed);
                self.pending = Some(PendingRecode { next: descriptor.next_attempt(bytes).attempt_key(), qp });
                FrameStatus::recode_too_small().with_min_frame_size(min_frame_size)
            } else {
                self.finish(min_frame_size as f64 * 8.0);
                FrameStatus::pad(min_frame_size)
            }
        } else {
            self.qp.adapt(class, Self::layer_offset(descriptor), qp_used, bits, target);
            self.finish(bits);
            FrameStatus::accept()
        };

        trace!(
            frame = descriptor.encoded_order,
            attempt = descriptor.num_recode,
            qp = qp_used,
            bits,
            target,
            verdict = ?status.verdict,
            "Built-in update"
        );
        Ok(status)
    }

    /// Close the frame, committing `bits` to the buffer.
    fn finish(&mut self, bits: f64) {
        if let Some(hrd) = &mut self.hrd {
            hrd.commit(bits);
        }
        self.pending = None;
        self.frames += 1;
        self.bits += bits;
    }

    fn reset(&mut self, config: &BrcConfig, change: ConfigChange) {
        match change {
            ConfigChange::Identical => {}
            ConfigChange::RateOnly => {
                let model = config.buffer_model();
                if let Some(hrd) = &mut self.hrd {
                    hrd.rescale(model, config.method == RateControlMethod::Cbr);
                }
                self.qp.set_limits(&config.qp);
                self.targets = ClassTargets::new(&config.gop, model.bits_per_frame);
                self.config = config.clone();
            }
            ConfigChange::Structural => *self = Self::new(config),
        }
    }

    fn snapshot(&self) -> BuiltinSnapshot {
        BuiltinSnapshot {
            fullness_bits: self.hrd.as_ref().map(HrdBuffer::fullness),
            class_qp: FrameClass::ALL.map(|class| self.qp.class_qp(class)),
            frames: self.frames,
            bits: self.bits,
        }
    }
}

/// The rate controller used when a session is configured for built-in mode.
#[derive(Debug, Clone, Default)]
pub struct BuiltinController {
    state: Option<BuiltinState>,
}

impl BuiltinController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current statistics, `None` before init or after close.
    pub fn snapshot(&self) -> Option<BuiltinSnapshot> {
        self.state.as_ref().map(BuiltinState::snapshot)
    }

    fn state(&self, operation: Operation) -> Result<&BuiltinState> {
        self.state.as_ref().ok_or_else(|| BrcError::invalid_state(operation, "built-in controller not initialized"))
    }

    fn state_mut(&mut self, operation: Operation) -> Result<&mut BuiltinState> {
        self.state.as_mut().ok_or_else(|| BrcError::invalid_state(operation, "built-in controller not initialized"))
    }
}

impl RateController for BuiltinController {
    fn init(&mut self, config: &BrcConfig) -> Result<()> {
        if self.state.is_some() {
            return Err(BrcError::invalid_state(Operation::Init, "built-in controller already initialized"));
        }
        let state = BuiltinState::new(config);
        debug!(
            method = ?config.method,
            buffer_bits = state.hrd.as_ref().map(|h| h.model().size_bits),
            "Built-in rate control initialized"
        );
        self.state = Some(state);
        Ok(())
    }

    fn reset(&mut self, config: &BrcConfig, change: ConfigChange) -> Result<()> {
        self.state_mut(Operation::Reset)?.reset(config, change);
        Ok(())
    }

    fn close(&mut self) {
        self.state = None;
    }

    fn frame_control(&self, descriptor: &FrameDescriptor) -> Result<FrameControl> {
        self.state(Operation::FrameControl)?.frame_control(descriptor)
    }

    fn update(&mut self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<FrameStatus> {
        self.state_mut(Operation::Update)?.update(descriptor, control)
    }

    fn abandon_frame(&mut self, descriptor: &FrameDescriptor, verdict: BrcStatus, padded_size: u32) -> Result<()> {
        let state = self.state_mut(Operation::Abandon)?;
        let bits = match verdict {
            BrcStatus::PanicTooSmall => padded_size as f64 * 8.0,
            _ => 0.0,
        };
        trace!(frame = descriptor.encoded_order, ?verdict, bits, "Built-in frame abandoned");
        state.finish(bits);
        Ok(())
    }

    fn name(&self) -> &str {
        "built-in"
    }
}
