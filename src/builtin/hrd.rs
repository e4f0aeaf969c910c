//! Coded picture buffer leaky-bucket model

use crate::config::BufferModel;

/// Result of checking one coded frame against the buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BufferCheck {
    Fits,
    /// Removing the frame would drain the buffer below empty by `excess_bits`
    Underflow { excess_bits: f64 },
    /// The next arrival would overflow the buffer unless `missing_bits` more are spent
    Overflow { missing_bits: f64 },
}

/// Decoder-side CPB fullness tracked at frame removal times.
#[derive(Debug, Clone, PartialEq)]
pub struct HrdBuffer {
    model: BufferModel,
    /// Bits in the buffer just before the next frame is removed
    fullness: f64,
    /// Bits keep arriving at the target rate and overflow must be padded away
    constant_rate: bool,
}

impl HrdBuffer {
    pub fn new(model: BufferModel, constant_rate: bool) -> Self {
        Self { fullness: model.initial_bits, model, constant_rate }
    }

    pub fn fullness(&self) -> f64 {
        self.fullness
    }

    pub fn model(&self) -> &BufferModel {
        &self.model
    }

    /// Fullness relative to the initial delay; positive when the encoder has
    /// been spending less than the arrival rate.
    pub fn surplus_ratio(&self) -> f64 {
        if self.model.size_bits <= 0.0 {
            return 0.0;
        }
        (self.fullness - self.model.initial_bits) / self.model.size_bits
    }

    fn arrival(&self) -> f64 {
        if self.constant_rate { self.model.bits_per_frame } else { self.model.max_bits_per_frame }
    }

    pub fn check(&self, frame_bits: f64) -> BufferCheck {
        let after_removal = self.fullness - frame_bits;
        if after_removal < 0.0 {
            return BufferCheck::Underflow { excess_bits: -after_removal };
        }
        let next = after_removal + self.arrival();
        if self.constant_rate && next > self.model.size_bits {
            return BufferCheck::Overflow { missing_bits: next - self.model.size_bits };
        }
        BufferCheck::Fits
    }

    /// Remove a finalized frame and add the next interval's arrival.
    pub fn commit(&mut self, frame_bits: f64) {
        let after_removal = (self.fullness - frame_bits).max(0.0);
        self.fullness = (after_removal + self.arrival()).min(self.model.size_bits);
    }

    /// Switch to a new model, keeping the relative fullness.
    pub fn rescale(&mut self, model: BufferModel, constant_rate: bool) {
        let ratio = if self.model.size_bits > 0.0 { self.fullness / self.model.size_bits } else { 0.5 };
        self.fullness = ratio * model.size_bits;
        self.model = model;
        self.constant_rate = constant_rate;
    }
}
