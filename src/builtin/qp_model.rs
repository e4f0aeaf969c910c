//! Per-class QP tracking with a logarithmic rate/quantizer model

use crate::config::{GopStructure, QpParams};
use crate::types::FrameClass;

/// Quantizer steps double every 6 QP, so coded size roughly halves.
const QP_PER_OCTAVE: f64 = 6.0;

/// Largest QP move after an accepted frame.
const MAX_ADAPT_STEP: f64 = 3.0;

/// Largest QP move between two recode attempts.
const MAX_RECODE_STEP: i32 = 10;

/// Relative bit weight of each class within a GOP.
const CLASS_WEIGHT: [f64; 3] = [3.0, 1.0, 0.6];

/// QP gap between classes when a scene change resets the model.
const CLASS_QP_OFFSET: [i32; 3] = [0, 2, 4];

/// QP the model moves by to change coded size by `ratio`.
pub fn qp_delta_for_ratio(ratio: f64) -> f64 {
    if ratio <= 0.0 { 0.0 } else { QP_PER_OCTAVE * ratio.log2() }
}

/// Base QP per frame class, before pyramid-layer offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct QpModel {
    base: [f64; 3],
    min: i32,
    max: i32,
}

impl QpModel {
    pub fn new(params: &QpParams) -> Self {
        Self { base: [params.i as f64, params.p as f64, params.b as f64], min: params.min, max: params.max }
    }

    /// Adopt new limits and pull the tracked QPs inside them.
    pub fn set_limits(&mut self, params: &QpParams) {
        self.min = params.min;
        self.max = params.max;
        for qp in &mut self.base {
            *qp = qp.clamp(params.min as f64, params.max as f64);
        }
    }

    pub fn clamp(&self, qp: i32) -> i32 {
        qp.clamp(self.min, self.max)
    }

    pub fn at_max(&self, qp: i32) -> bool {
        qp >= self.max
    }

    pub fn at_min(&self, qp: i32) -> bool {
        qp <= self.min
    }

    /// QP for a frame of `class` at pyramid depth `layer`.
    pub fn qp_for(&self, class: FrameClass, layer: i32, scene_change: bool) -> i32 {
        let base = if scene_change && class != FrameClass::Intra {
            self.base[FrameClass::Intra.index()] + CLASS_QP_OFFSET[class.index()] as f64
        } else {
            self.base[class.index()]
        };
        self.clamp(base.round() as i32 + layer)
    }

    pub fn class_qp(&self, class: FrameClass) -> i32 {
        self.base[class.index()].round() as i32
    }

    /// Learn from an accepted frame coded at `qp_used` with `bits` against `target_bits`.
    pub fn adapt(&mut self, class: FrameClass, layer: i32, qp_used: i32, bits: f64, target_bits: f64) {
        if target_bits <= 0.0 || bits <= 0.0 {
            return;
        }
        let step = qp_delta_for_ratio(bits / target_bits).clamp(-MAX_ADAPT_STEP, MAX_ADAPT_STEP);
        let next = (qp_used - layer) as f64 + step;
        self.base[class.index()] = next.clamp(self.min as f64, self.max as f64);
    }

    /// QP for the next attempt after a frame came out `ratio` times the allowed size.
    ///
    /// Always moves at least one step in the corrective direction.
    pub fn recode_qp(&self, qp_used: i32, ratio: f64) -> i32 {
        let step = qp_delta_for_ratio(ratio).abs().ceil() as i32;
        let step = step.clamp(1, MAX_RECODE_STEP);
        let next = if ratio >= 1.0 { qp_used + step } else { qp_used - step };
        self.clamp(next)
    }
}

/// Bits budgeted per frame class so that one GOP averages the target rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassTargets {
    bits: [f64; 3],
}

impl ClassTargets {
    pub fn new(gop: &GopStructure, bits_per_frame: f64) -> Self {
        let frames = gop.pic_size.max(1) as f64;
        let anchors = ((gop.pic_size.max(1) - 1) / gop.ref_dist.max(1)) as f64;
        let bidir = frames - 1.0 - anchors;
        let total_weight =
            CLASS_WEIGHT[0] + anchors * CLASS_WEIGHT[1] + bidir.max(0.0) * CLASS_WEIGHT[2];
        let gop_bits = bits_per_frame * frames;

        let mut bits = [0.0; 3];
        for class in FrameClass::ALL {
            bits[class.index()] = gop_bits * CLASS_WEIGHT[class.index()] / total_weight;
        }
        Self { bits }
    }

    /// Budget for one frame, scaled by how far the buffer sits from its initial level.
    pub fn target(&self, class: FrameClass, surplus_ratio: f64) -> f64 {
        self.bits[class.index()] * (1.0 + surplus_ratio).clamp(0.5, 1.5)
    }
}
