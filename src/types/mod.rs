//! Core data model of the rate-control protocol.
//!
//! This module provides the three per-attempt structures exchanged between the
//! encoder and a rate controller:
//! - [`FrameDescriptor`] describes the frame and attempt being coded (input)
//! - [`FrameControl`] carries the QP, CPB timing and repack limits (output of frame control)
//! - [`FrameStatus`] carries the [`BrcStatus`] verdict and padding size (output of update)
//!
//! ## Usage Example
//!
//! ```rust
//! use extbrc::types::{FrameControl, FrameDescriptor, FrameType};
//!
//! let first = FrameDescriptor::new(0, 0, FrameType::idr());
//! assert_eq!(first.num_recode, 0);
//!
//! // After a 48 kB attempt the next descriptor carries the measured size
//! let second = first.next_attempt(48_000);
//! assert_eq!(second.num_recode, 1);
//! assert_eq!(second.coded_frame_size, 48_000);
//!
//! // Repack fields are meaningless without a byte budget
//! let mut control = FrameControl::with_qp(30).with_repack(60_000, &[2, 2]);
//! control.max_frame_size = 0;
//! assert_eq!(control.normalized().max_num_repak, 0);
//! ```

mod control;
mod descriptor;
pub mod frame_flags;
mod frame_type;
mod status;

// Re-export all public types
pub use control::{CpbRemovalTiming, FrameControl, MAX_REPAK};
pub use descriptor::{AttemptKey, FrameDescriptor, FrameHints};
pub use frame_type::{FrameClass, FrameType};
pub use status::{BrcStatus, FrameStatus};

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    prop_compose! {
        fn arb_control()(
            qp_y in 0i32..52,
            max_frame_size in prop_oneof![Just(0u32), 1u32..2_000_000],
            delta_qp in prop::array::uniform8(0u8..8),
            max_num_repak in 0u16..32,
        ) -> FrameControl {
            FrameControl { qp_y, cpb_removal: None, max_frame_size, delta_qp, max_num_repak }
        }
    }

    proptest! {
        #[test]
        fn prop_normalized_control_honours_repack_invariant(control in arb_control()) {
            let normalized = control.normalized();

            if control.max_frame_size == 0 {
                prop_assert_eq!(normalized.delta_qp, [0u8; MAX_REPAK]);
                prop_assert_eq!(normalized.max_num_repak, 0);
            }
            prop_assert!(normalized.max_num_repak as usize <= MAX_REPAK);
            for delta in &normalized.delta_qp[normalized.max_num_repak as usize..] {
                prop_assert_eq!(*delta, 0);
            }
            // Idempotent
            prop_assert_eq!(normalized.normalized(), normalized);
            prop_assert_eq!(normalized.qp_y, control.qp_y);
        }

        #[test]
        fn prop_repack_qp_is_cumulative(control in arb_control()) {
            let control = control.normalized();
            let mut previous = control.qp_y;
            for repack in 0..MAX_REPAK {
                match control.repack_qp(repack) {
                    Some(qp) => {
                        prop_assert!(control.repack_enabled());
                        prop_assert_eq!(qp, previous + i32::from(control.delta_qp[repack]));
                        previous = qp;
                    }
                    None => prop_assert!(repack >= control.max_num_repak as usize),
                }
            }
        }

        #[test]
        fn prop_attempt_numbering_is_consecutive(
            encoded_order in any::<u32>(),
            sizes in prop::collection::vec(1u32..1_000_000, 0..16),
        ) {
            let mut descriptor = FrameDescriptor::new(encoded_order, 0, FrameType::predicted());
            for (expected, size) in sizes.iter().enumerate() {
                prop_assert_eq!(descriptor.num_recode as usize, expected);
                descriptor = descriptor.next_attempt(*size);
                prop_assert_eq!(descriptor.coded_frame_size, *size);
                prop_assert_eq!(descriptor.encoded_order, encoded_order);
            }
        }

        #[test]
        fn prop_verdict_codes_round_trip(code in 0u16..16) {
            match BrcStatus::try_from(code) {
                Ok(status) => prop_assert_eq!(status.code(), code),
                Err(_) => prop_assert!(code > 4),
            }
        }
    }

    #[test]
    fn frame_type_classes() {
        assert_eq!(FrameType::idr().class(), Some(FrameClass::Intra));
        assert!(FrameType::idr().is_idr());
        assert_eq!(FrameType::intra().class(), Some(FrameClass::Intra));
        assert!(FrameType::intra().is_reference() && !FrameType::intra().is_idr());
        assert_eq!(FrameType::predicted().class(), Some(FrameClass::Predicted));
        assert_eq!(FrameType::bidirectional().class(), Some(FrameClass::Bidirectional));
        assert!(!FrameType::bidirectional().is_reference());
        assert!(FrameType::bidirectional().with_reference().is_reference());
        assert_eq!(FrameType::new(frame_flags::UNKNOWN).class(), None);
        assert_eq!(FrameType::new(frame_flags::I | frame_flags::P).class(), Some(FrameClass::Intra));
    }

    #[test]
    fn cpb_timing_zero_pair_means_encoder_computes() {
        assert_eq!(CpbRemovalTiming::new(0, 0), None);
        assert_eq!(CpbRemovalTiming::new(90_000, 0), Some(CpbRemovalTiming { delay: 90_000, offset: 0 }));
    }

    #[test]
    fn verdict_classification() {
        assert!(BrcStatus::Accept.is_terminal());
        assert!(BrcStatus::PanicTooBig.is_terminal());
        assert!(BrcStatus::PanicTooSmall.is_panic());
        assert!(BrcStatus::RecodeTooBig.is_recode());
        assert!(!BrcStatus::RecodeTooSmall.is_terminal());
        assert_eq!(BrcStatus::RecodeTooBig.forced_panic(), BrcStatus::PanicTooBig);
        assert_eq!(BrcStatus::RecodeTooSmall.forced_panic(), BrcStatus::PanicTooSmall);
        assert_eq!(BrcStatus::Accept.forced_panic(), BrcStatus::Accept);
    }

    #[test]
    fn repack_schedule_is_truncated() {
        let control = FrameControl::with_qp(26).with_repack(10_000, &[1; 12]);
        assert_eq!(control.max_num_repak as usize, MAX_REPAK);
        assert_eq!(control.repack_qp(7), Some(34));
        assert_eq!(control.repack_qp(8), None);
    }

    #[test]
    fn hints_are_optional() {
        let plain = FrameDescriptor::new(3, 1, FrameType::predicted());
        assert!(!plain.is_scene_change());
        assert_eq!(plain.complexity(), None);

        let hinted = plain.with_hints(FrameHints { scene_change: true, long_term: false, complexity: 0 });
        assert!(hinted.is_scene_change());
        assert_eq!(hinted.complexity(), None);
    }
}
