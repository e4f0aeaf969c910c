//! Test utilities shared by unit tests, integration tests and benches
//!
//! Provides a realistic configuration, a deterministic frame sequence and a
//! synthetic encoder whose coded size follows the usual QP/size relationship.

#![cfg(any(test, feature = "benchmark"))]

use crate::Result;
use crate::config::{BrcConfig, FrameRate, Resolution};
use crate::recode::FrameCoder;
use crate::repack::{CodedFrame, encode_with_repack};
use crate::types::{FrameClass, FrameControl, FrameDescriptor, FrameType};

/// Intra period of [`ramp_frames`].
pub const SAMPLE_GOP: u32 = 30;

/// 2 Mbit/s CBR at 720p30 with a recode budget of 4.
pub fn sample_config() -> BrcConfig {
    BrcConfig::cbr(2_000, FrameRate { num: 30, den: 1 }, Resolution { width: 1280, height: 720 }, 4)
}

/// `count` first-attempt descriptors in encode order: an IDR every
/// [`SAMPLE_GOP`] frames, P frames otherwise.
pub fn ramp_frames(count: u32) -> Vec<FrameDescriptor> {
    (0..count)
        .map(|index| {
            let frame_type = if index % SAMPLE_GOP == 0 { FrameType::idr() } else { FrameType::predicted() };
            FrameDescriptor::new(index, index, frame_type)
        })
        .collect()
}

/// Coded size of a [`ramp_frames`] frame, sitting comfortably inside
/// [`sample_config`]'s buffer.
pub fn ramp_size(descriptor: &FrameDescriptor) -> u32 {
    if descriptor.frame_type.is_idr() { 20_000 } else { 8_000 }
}

/// Encoder stand-in: size halves every 6 QP steps.
#[derive(Debug, Clone)]
pub struct SyntheticCoder {
    /// Bytes of a P frame at QP 26
    pub base_bytes: f64,
    pub encodes: usize,
    pub skipped: Vec<u32>,
    /// (encoded order, padded size)
    pub padded: Vec<(u32, u32)>,
}

impl SyntheticCoder {
    pub fn new(base_bytes: f64) -> Self {
        Self { base_bytes, encodes: 0, skipped: Vec::new(), padded: Vec::new() }
    }

    /// Coded size of `descriptor` at `qp`.
    pub fn frame_bytes(base_bytes: f64, descriptor: &FrameDescriptor, qp: i32) -> u32 {
        let class_scale = match descriptor.frame_type.class() {
            Some(FrameClass::Intra) => 3.0,
            Some(FrameClass::Bidirectional) => 0.6,
            _ => 1.0,
        };
        let complexity = descriptor.complexity().map_or(1.0, |c| c as f64 / 100.0);
        let bytes = base_bytes * class_scale * complexity * 2f64.powf(f64::from(26 - qp) / 6.0);
        bytes.round().max(1.0) as u32
    }
}

impl Default for SyntheticCoder {
    fn default() -> Self {
        Self::new(8_000.0)
    }
}

impl FrameCoder for SyntheticCoder {
    fn encode(&mut self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<CodedFrame> {
        let base_bytes = self.base_bytes;
        let coded = encode_with_repack(control, |qp| Ok(Self::frame_bytes(base_bytes, descriptor, qp)))?;
        self.encodes += 1;
        Ok(coded)
    }

    fn skip(&mut self, descriptor: &FrameDescriptor) -> Result<()> {
        self.skipped.push(descriptor.encoded_order);
        Ok(())
    }

    fn pad(&mut self, descriptor: &FrameDescriptor, _coded: &CodedFrame, padded_size: u32) -> Result<()> {
        self.padded.push((descriptor.encoded_order, padded_size));
        Ok(())
    }
}

/// Coder returning a fixed size for every attempt.
#[derive(Debug, Clone, Default)]
pub struct FixedCoder {
    pub size: u32,
    pub encodes: usize,
    pub skipped: usize,
    pub padded: Vec<u32>,
}

impl FixedCoder {
    pub fn new(size: u32) -> Self {
        Self { size, ..Self::default() }
    }
}

impl FrameCoder for FixedCoder {
    fn encode(&mut self, _descriptor: &FrameDescriptor, control: &FrameControl) -> Result<CodedFrame> {
        self.encodes += 1;
        Ok(CodedFrame::single_pass(self.size, control.qp_y))
    }

    fn skip(&mut self, _descriptor: &FrameDescriptor) -> Result<()> {
        self.skipped += 1;
        Ok(())
    }

    fn pad(&mut self, _descriptor: &FrameDescriptor, _coded: &CodedFrame, padded_size: u32) -> Result<()> {
        self.padded.push(padded_size);
        Ok(())
    }
}
