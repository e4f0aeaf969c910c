//! Rate-control session configuration.
//!
//! [`BrcConfig`] replaces the fixed binary parameter block of hardware encoder
//! runtimes with a versioned, extensible structure. Unknown top-level keys are
//! kept in [`BrcConfig::extensions`] so external rate controllers can read
//! their own settings from the same document.
//!
//! ```rust
//! use extbrc::config::{BrcConfig, RateControlMethod};
//!
//! let yaml = r#"
//! method: cbr
//! target_kbps: 4000
//! frame_rate: { num: 30, den: 1 }
//! resolution: { width: 1920, height: 1080 }
//! max_recode: 3
//! lookahead_depth: 8
//! "#;
//!
//! let config = BrcConfig::from_yaml(yaml).unwrap();
//! assert_eq!(config.method, RateControlMethod::Cbr);
//! assert!(config.extensions.contains_key("lookahead_depth"));
//! ```

mod change;

pub use change::ConfigChange;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::types::MAX_REPAK;
use crate::{BrcError, Result};

/// Newest configuration layout this crate understands.
pub const CONFIG_VERSION: u32 = 1;

/// Highest QP accepted by the supported codecs.
pub const QP_LIMIT: i32 = 51;

fn default_version() -> u32 {
    CONFIG_VERSION
}

/// Which rate-control capability a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrcMode {
    #[default]
    BuiltIn,
    External,
}

/// Rate-control method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControlMethod {
    /// Constant bitrate; buffer overflow is resolved by padding
    Cbr,
    /// Variable bitrate bounded by `max_kbps`
    Vbr,
    /// Constant QP; no buffer model
    Cqp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub fn fps(&self) -> f64 {
        if self.den == 0 { 0.0 } else { self.num as f64 / self.den as f64 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Check whether this resolution fits into surfaces allocated for `allocated`.
    pub fn fits_within(&self, allocated: &Resolution) -> bool {
        self.width <= allocated.width && self.height <= allocated.height
    }
}

/// Reference structure of the coded sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GopStructure {
    /// Frames between intra frames
    pub pic_size: u16,
    /// Distance between anchor frames (1 means no B frames)
    pub ref_dist: u16,
    /// Depth of the B/P pyramid
    pub pyramid_depth: u16,
}

impl Default for GopStructure {
    fn default() -> Self {
        Self { pic_size: 30, ref_dist: 1, pyramid_depth: 0 }
    }
}

/// Hypothetical reference decoder parameters.
///
/// Sizes are in kilobytes of 1000 bytes; 0 lets the rate controller derive a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HrdParams {
    pub buffer_size_kb: u32,
    pub initial_delay_kb: u32,
    /// Enforce CPB underflow/overflow limits with recode and panic verdicts
    pub conformance: bool,
    /// Supply initial CPB removal timing instead of letting the encoder compute it
    pub supply_cpb_timing: bool,
}

impl Default for HrdParams {
    fn default() -> Self {
        Self { buffer_size_kb: 0, initial_delay_kb: 0, conformance: true, supply_cpb_timing: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpParams {
    pub min: i32,
    pub max: i32,
    /// Intra QP (CQP value, initial QP otherwise)
    pub i: i32,
    pub p: i32,
    pub b: i32,
}

impl Default for QpParams {
    fn default() -> Self {
        Self { min: 1, max: QP_LIMIT, i: 26, p: 28, b: 30 }
    }
}

/// Encoder-local repack limits placed into every frame control.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepackParams {
    /// Byte budget per frame; 0 disables repacking
    pub max_frame_size: u32,
    pub max_num_repak: u16,
    /// Per-repack QP increments; missing entries default to 1
    pub delta_qp: Vec<u8>,
}

impl RepackParams {
    /// Delta schedule of exactly `max_num_repak` entries.
    pub fn schedule(&self) -> Vec<u8> {
        (0..self.max_num_repak as usize).map(|i| self.delta_qp.get(i).copied().unwrap_or(1)).collect()
    }
}

/// Derived CPB leaky-bucket parameters, all in bits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferModel {
    pub size_bits: f64,
    pub initial_bits: f64,
    /// Average bits arriving per frame interval at the target rate
    pub bits_per_frame: f64,
    /// Bits arriving per frame interval at the peak rate
    pub max_bits_per_frame: f64,
}

/// Full configuration of a rate-control session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrcConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub mode: BrcMode,
    pub method: RateControlMethod,
    #[serde(default)]
    pub target_kbps: u32,
    /// Peak rate; 0 means equal to the target
    #[serde(default)]
    pub max_kbps: u32,
    pub frame_rate: FrameRate,
    pub resolution: Resolution,
    #[serde(default)]
    pub gop: GopStructure,
    #[serde(default)]
    pub hrd: HrdParams,
    #[serde(default)]
    pub qp: QpParams,
    #[serde(default)]
    pub repack: RepackParams,
    /// Recodes allowed per frame before the recode loop forces a panic verdict
    pub max_recode: u16,
    /// Unknown keys, reserved for external rate controllers
    #[serde(flatten)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, serde_yaml_ng::Value>,
}

impl BrcConfig {
    fn base(method: RateControlMethod, target_kbps: u32, frame_rate: FrameRate, resolution: Resolution, max_recode: u16) -> Self {
        Self {
            version: CONFIG_VERSION,
            mode: BrcMode::BuiltIn,
            method,
            target_kbps,
            max_kbps: 0,
            frame_rate,
            resolution,
            gop: GopStructure::default(),
            hrd: HrdParams::default(),
            qp: QpParams::default(),
            repack: RepackParams::default(),
            max_recode,
            extensions: HashMap::new(),
        }
    }

    /// Constant-bitrate configuration with derived buffer parameters.
    pub fn cbr(target_kbps: u32, frame_rate: FrameRate, resolution: Resolution, max_recode: u16) -> Self {
        Self::base(RateControlMethod::Cbr, target_kbps, frame_rate, resolution, max_recode)
    }

    /// Variable-bitrate configuration peaking at `max_kbps`.
    pub fn vbr(
        target_kbps: u32,
        max_kbps: u32,
        frame_rate: FrameRate,
        resolution: Resolution,
        max_recode: u16,
    ) -> Self {
        Self { max_kbps, ..Self::base(RateControlMethod::Vbr, target_kbps, frame_rate, resolution, max_recode) }
    }

    /// Constant-QP configuration.
    pub fn cqp(qp: QpParams, frame_rate: FrameRate, resolution: Resolution) -> Self {
        Self { qp, ..Self::base(RateControlMethod::Cqp, 0, frame_rate, resolution, 0) }
    }

    /// Parse and validate a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BrcConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        debug!(
            method = ?config.method,
            target_kbps = config.target_kbps,
            extensions = config.extensions.len(),
            "Loaded rate-control configuration"
        );
        Ok(config)
    }

    /// Read, parse and validate a YAML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| BrcError::Config {
            context: path.display().to_string(),
            details: e.to_string(),
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    pub fn uses_buffer_model(&self) -> bool {
        self.method != RateControlMethod::Cqp
    }

    /// Effective peak rate in kbps.
    pub fn peak_kbps(&self) -> u32 {
        match self.method {
            RateControlMethod::Cbr => self.target_kbps,
            _ if self.max_kbps == 0 => self.target_kbps,
            _ => self.max_kbps,
        }
    }

    /// Leaky-bucket parameters, deriving buffer size (one second at the peak
    /// rate) and initial delay (half the buffer) when they are left at 0.
    pub fn buffer_model(&self) -> BufferModel {
        let fps = self.frame_rate.fps();
        let per_frame = |kbps: u32| if fps > 0.0 { kbps as f64 * 1000.0 / fps } else { 0.0 };

        let size_bits = if self.hrd.buffer_size_kb == 0 {
            self.peak_kbps() as f64 * 1000.0
        } else {
            self.hrd.buffer_size_kb as f64 * 8000.0
        };
        let initial_bits = if self.hrd.initial_delay_kb == 0 {
            size_bits / 2.0
        } else {
            self.hrd.initial_delay_kb as f64 * 8000.0
        };

        BufferModel {
            size_bits,
            initial_bits,
            bits_per_frame: per_frame(self.target_kbps),
            max_bits_per_frame: per_frame(self.peak_kbps()),
        }
    }

    /// Validate the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 || self.version > CONFIG_VERSION {
            return Err(BrcError::unsupported(format!(
                "configuration version {} (supported up to {})",
                self.version, CONFIG_VERSION
            )));
        }

        if self.frame_rate.num == 0 || self.frame_rate.den == 0 {
            return Err(BrcError::unsupported(format!(
                "frame rate {}/{}",
                self.frame_rate.num, self.frame_rate.den
            )));
        }

        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(BrcError::unsupported(format!(
                "resolution {}x{}",
                self.resolution.width, self.resolution.height
            )));
        }

        if self.gop.pic_size == 0 || self.gop.ref_dist == 0 {
            return Err(BrcError::unsupported(format!(
                "GOP size {} with reference distance {}",
                self.gop.pic_size, self.gop.ref_dist
            )));
        }

        let qp = &self.qp;
        if qp.min < 0 || qp.max > QP_LIMIT || qp.min > qp.max {
            return Err(BrcError::unsupported(format!("QP range {}..={}", qp.min, qp.max)));
        }
        for (name, value) in [("i", qp.i), ("p", qp.p), ("b", qp.b)] {
            if value < qp.min || value > qp.max {
                return Err(BrcError::unsupported(format!(
                    "{} QP {} outside {}..={}",
                    name, value, qp.min, qp.max
                )));
            }
        }

        if self.repack.max_num_repak as usize > MAX_REPAK || self.repack.delta_qp.len() > MAX_REPAK {
            return Err(BrcError::unsupported(format!(
                "repack count {} exceeds {}",
                self.repack.max_num_repak.max(self.repack.delta_qp.len() as u16),
                MAX_REPAK
            )));
        }

        match self.method {
            RateControlMethod::Cqp => Ok(()),
            RateControlMethod::Cbr | RateControlMethod::Vbr => self.validate_buffer_model(),
        }
    }

    fn validate_buffer_model(&self) -> Result<()> {
        if self.target_kbps == 0 {
            return Err(BrcError::unsupported("bitrate-driven method with zero target bitrate"));
        }

        if self.method == RateControlMethod::Cbr && self.max_kbps != 0 && self.max_kbps != self.target_kbps {
            return Err(BrcError::unsupported(format!(
                "CBR with peak {} kbps different from target {} kbps",
                self.max_kbps, self.target_kbps
            )));
        }

        if self.method == RateControlMethod::Vbr && self.max_kbps != 0 && self.max_kbps < self.target_kbps {
            return Err(BrcError::unsupported(format!(
                "VBR peak {} kbps below target {} kbps",
                self.max_kbps, self.target_kbps
            )));
        }

        let model = self.buffer_model();
        if model.size_bits < model.max_bits_per_frame {
            return Err(BrcError::unsupported(format!(
                "CPB of {} bits cannot hold one frame interval ({:.0} bits)",
                model.size_bits, model.max_bits_per_frame
            )));
        }
        if model.initial_bits > model.size_bits {
            return Err(BrcError::unsupported(format!(
                "initial delay {} kB exceeds buffer size {} kB",
                self.hrd.initial_delay_kb, self.hrd.buffer_size_kb
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hd() -> Resolution {
        Resolution { width: 1920, height: 1080 }
    }

    fn fps30() -> FrameRate {
        FrameRate { num: 30, den: 1 }
    }

    #[test]
    fn yaml_round_trip_keeps_extensions() {
        let yaml = r#"
version: 1
mode: external
method: vbr
target_kbps: 3000
max_kbps: 6000
frame_rate: { num: 60000, den: 1001 }
resolution: { width: 1280, height: 720 }
gop: { pic_size: 60, ref_dist: 4, pyramid_depth: 2 }
hrd: { buffer_size_kb: 1500, initial_delay_kb: 750 }
repack: { max_frame_size: 90000, max_num_repak: 2, delta_qp: [2] }
max_recode: 2
vendor_tuning: { aggressiveness: 3 }
"#;
        let config = BrcConfig::from_yaml(yaml).expect("valid config");
        assert_eq!(config.mode, BrcMode::External);
        assert_eq!(config.gop.ref_dist, 4);
        assert!(config.hrd.conformance);
        assert_eq!(config.repack.schedule(), vec![2, 1]);
        assert!(config.extensions.contains_key("vendor_tuning"));

        let reparsed = BrcConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn loads_configuration_from_file() {
        let path = std::env::temp_dir().join(format!("extbrc-config-{}.yaml", std::process::id()));
        let config = BrcConfig::cbr(2_500, fps30(), hd(), 3);
        std::fs::write(&path, config.to_yaml().unwrap()).unwrap();

        let loaded = BrcConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.unwrap(), config);

        let err = BrcConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, BrcError::Config { ref context, .. } if context.contains("extbrc-config")));
    }

    #[test]
    fn missing_recode_budget_is_a_config_error() {
        let yaml = r#"
method: cbr
target_kbps: 3000
frame_rate: { num: 30, den: 1 }
resolution: { width: 1280, height: 720 }
"#;
        let err = BrcConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, BrcError::Config { .. }));
    }

    #[test]
    fn derived_buffer_model() {
        let config = BrcConfig::cbr(3000, fps30(), hd(), 2);
        let model = config.buffer_model();
        assert_eq!(model.size_bits, 3_000_000.0);
        assert_eq!(model.initial_bits, 1_500_000.0);
        assert!((model.bits_per_frame - 100_000.0).abs() < 1e-6);
        assert_eq!(model.bits_per_frame, model.max_bits_per_frame);
    }

    #[test]
    fn inconsistent_buffer_model_is_unsupported() {
        let mut config = BrcConfig::cbr(3000, fps30(), hd(), 2);
        config.hrd.buffer_size_kb = 10; // 80 kbit < 100 kbit per frame
        assert!(config.validate().unwrap_err().is_unsupported());

        let mut config = BrcConfig::cbr(3000, fps30(), hd(), 2);
        config.hrd.buffer_size_kb = 400;
        config.hrd.initial_delay_kb = 500;
        assert!(config.validate().unwrap_err().is_unsupported());

        let config = BrcConfig::vbr(3000, 2000, fps30(), hd(), 2);
        assert!(config.validate().unwrap_err().is_unsupported());
    }

    #[test]
    fn invalid_shapes_are_unsupported() {
        let mut config = BrcConfig::cbr(3000, fps30(), hd(), 2);
        config.repack.max_num_repak = 9;
        assert!(config.validate().is_err());

        let config = BrcConfig::cbr(3000, FrameRate { num: 30, den: 0 }, hd(), 2);
        assert!(config.validate().is_err());

        let mut config = BrcConfig::cbr(3000, fps30(), hd(), 2);
        config.version = CONFIG_VERSION + 1;
        assert!(config.validate().is_err());

        let config = BrcConfig::cqp(QpParams { min: 10, max: 40, i: 5, p: 20, b: 22 }, fps30(), hd());
        assert!(config.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_cqp_in_range_is_accepted(min in 0i32..=25, span in 0i32..=26) {
            let max = min + span;
            let qp = QpParams { min, max, i: min, p: max, b: min + span / 2 };
            let config = BrcConfig::cqp(qp, fps30(), hd());
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_derived_buffer_holds_a_frame(target_kbps in 100u32..100_000, fps in 1u32..240) {
            let config = BrcConfig::cbr(target_kbps, FrameRate { num: fps, den: 1 }, hd(), 1);
            prop_assert!(config.validate().is_ok());
            let model = config.buffer_model();
            prop_assert!(model.size_bits >= model.max_bits_per_frame);
            prop_assert!(model.initial_bits <= model.size_bits);
        }
    }
}
