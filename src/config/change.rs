//! Classification of configuration changes applied through reset

use super::{BrcConfig, Resolution};
use crate::{BrcError, Result};

/// How a reset configuration relates to the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// Nothing changed; statistics continue untouched
    Identical,
    /// Rates, buffer sizes, QP limits or budgets changed; statistics are kept
    /// and buffer fullness is rescaled
    RateOnly,
    /// Method, frame rate, GOP or resolution changed; statistics restart
    Structural,
}

impl ConfigChange {
    /// Classify the move from `current` to `next` for a session whose
    /// surfaces were allocated for `allocated`.
    ///
    /// Returns [`BrcError::IncompatibleState`] when the change needs a new
    /// session: growing past the allocation or switching between built-in
    /// and external rate control.
    pub fn classify(allocated: &Resolution, current: &BrcConfig, next: &BrcConfig) -> Result<Self> {
        if next.mode != current.mode {
            return Err(BrcError::incompatible(format!(
                "switching rate control from {:?} to {:?}",
                current.mode, next.mode
            )));
        }

        if !next.resolution.fits_within(allocated) {
            return Err(BrcError::incompatible(format!(
                "resolution {}x{} exceeds allocated {}x{}",
                next.resolution.width, next.resolution.height, allocated.width, allocated.height
            )));
        }

        if current == next {
            return Ok(ConfigChange::Identical);
        }

        let structural = current.method != next.method
            || current.frame_rate != next.frame_rate
            || current.gop != next.gop
            || current.resolution != next.resolution;

        Ok(if structural { ConfigChange::Structural } else { ConfigChange::RateOnly })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrcMode, FrameRate, GopStructure};

    fn base() -> BrcConfig {
        BrcConfig::cbr(4000, FrameRate { num: 30, den: 1 }, Resolution { width: 1920, height: 1080 }, 2)
    }

    #[test]
    fn identical_configuration() {
        let config = base();
        let change = ConfigChange::classify(&config.resolution, &config, &config.clone()).unwrap();
        assert_eq!(change, ConfigChange::Identical);
    }

    #[test]
    fn bitrate_change_keeps_statistics() {
        let current = base();
        let mut next = base();
        next.target_kbps = 6000;
        next.max_recode = 4;
        let change = ConfigChange::classify(&current.resolution, &current, &next).unwrap();
        assert_eq!(change, ConfigChange::RateOnly);
    }

    #[test]
    fn gop_or_downscale_is_structural() {
        let current = base();
        let mut next = base();
        next.gop = GopStructure { pic_size: 60, ref_dist: 3, pyramid_depth: 1 };
        assert_eq!(
            ConfigChange::classify(&current.resolution, &current, &next).unwrap(),
            ConfigChange::Structural
        );

        let mut next = base();
        next.resolution = Resolution { width: 1280, height: 720 };
        assert_eq!(
            ConfigChange::classify(&current.resolution, &current, &next).unwrap(),
            ConfigChange::Structural
        );
    }

    #[test]
    fn growth_past_allocation_needs_reallocation() {
        let current = base();
        let mut next = base();
        next.resolution = Resolution { width: 3840, height: 2160 };
        let err = ConfigChange::classify(&current.resolution, &current, &next).unwrap_err();
        assert!(err.requires_reallocation());
    }

    #[test]
    fn mode_switch_needs_reallocation() {
        let current = base();
        let mut next = base();
        next.mode = BrcMode::External;
        let err = ConfigChange::classify(&current.resolution, &current, &next).unwrap_err();
        assert!(err.requires_reallocation());
    }
}
