//! Error types for the rate-control protocol.
//!
//! Every protocol call returns [`Result`]. `Ok` is the protocol's *Success*;
//! the error kinds below keep the three protocol status codes distinct so the
//! encoder can react differently to each of them.
//!
//! ## Error Categories
//!
//! - **Configuration**: [`BrcError::Unsupported`], [`BrcError::IncompatibleState`]
//!   and [`BrcError::Config`] come out of init/reset and are never retried internally
//! - **Protocol ordering**: [`BrcError::InvalidState`] is a defect in the driver
//!   calling the session (wrong lifecycle state, out-of-order attempts)
//! - **Runtime**: [`BrcError::Strategy`] and [`BrcError::Encoder`] are failures of
//!   the rate controller or the encoder collaborator mid-stream; both are fatal
//!
//! Rate-control verdicts ([`BrcStatus`](crate::BrcStatus)) are *not* errors and
//! never travel through this type.
//!
//! ```rust
//! use extbrc::BrcError;
//!
//! let error = BrcError::incompatible("resolution grows past the allocated 1920x1080");
//! if error.requires_reallocation() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T, E = BrcError> = std::result::Result<T, E>;

/// Protocol operation names used in error context and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    Reset,
    Close,
    FrameControl,
    Update,
    Abandon,
    /// Read-only access to session state or statistics
    Inspect,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Init => "init",
            Operation::Reset => "reset",
            Operation::Close => "close",
            Operation::FrameControl => "frame_control",
            Operation::Update => "update",
            Operation::Abandon => "abandon",
            Operation::Inspect => "inspect",
        };
        f.write_str(name)
    }
}

/// Main error type for rate-control operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrcError {
    #[error("Unsupported configuration: {reason}")]
    Unsupported { reason: String },

    #[error("Configuration incompatible with allocated resources: {reason}")]
    IncompatibleState { reason: String },

    #[error("Invalid state for {operation}: {details}")]
    InvalidState { operation: Operation, details: String },

    #[error("Configuration error in {context}: {details}")]
    Config { context: String, details: String },

    #[error("Rate controller failed during {operation}: {details}")]
    Strategy {
        operation: Operation,
        details: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Encoder failed: {context}")]
    Encoder {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BrcError {
    /// The caller must tear the session down and initialize it again before
    /// retrying with this configuration.
    pub fn requires_reallocation(&self) -> bool {
        matches!(self, BrcError::IncompatibleState { .. })
    }

    /// The configuration itself was rejected.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, BrcError::Unsupported { .. } | BrcError::Config { .. })
    }

    /// The caller violated call ordering. This is a programming defect.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, BrcError::InvalidState { .. })
    }

    /// Returns whether the encoding session cannot continue after this error.
    ///
    /// Configuration errors are fatal only to the init/reset call that produced
    /// them; an already running session keeps its previous configuration.
    pub fn is_fatal(&self) -> bool {
        match self {
            BrcError::Unsupported { .. } => false,
            BrcError::IncompatibleState { .. } => false,
            BrcError::Config { .. } => false,
            BrcError::InvalidState { .. } => true,
            BrcError::Strategy { .. } => true,
            BrcError::Encoder { .. } => true,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            BrcError::Unsupported { .. } => vec![
                "Check bitrate, buffer size and initial delay for consistency",
                "Verify the QP range lies within 0..=51",
                "Select a rate-control method this strategy supports",
            ],
            BrcError::IncompatibleState { .. } => vec![
                "Close the session and initialize it with the new configuration",
                "Reallocate encoder surfaces for the new resolution",
            ],
            BrcError::InvalidState { .. } => vec![
                "Call init before any per-frame operation",
                "Call update exactly once after each frame_control",
                "Drain the recode loop before reset or close",
            ],
            BrcError::Config { .. } => vec![
                "Check the configuration document syntax",
                "Verify required fields such as max_recode are present",
            ],
            BrcError::Strategy { .. } => vec![
                "Close the session; rate-control state is no longer trustworthy",
                "Inspect the external rate controller for internal faults",
            ],
            BrcError::Encoder { .. } => vec![
                "Inspect the encoder collaborator error source",
                "Close the session before starting a new encode",
            ],
        }
    }

    /// Helper constructor for unsupported configurations.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        BrcError::Unsupported { reason: reason.into() }
    }

    /// Helper constructor for changes that need resource reallocation.
    pub fn incompatible(reason: impl Into<String>) -> Self {
        BrcError::IncompatibleState { reason: reason.into() }
    }

    /// Helper constructor for protocol-ordering violations.
    pub fn invalid_state(operation: Operation, details: impl Into<String>) -> Self {
        BrcError::InvalidState { operation, details: details.into() }
    }

    /// Helper constructor for failures inside a rate controller.
    pub fn strategy(operation: Operation, details: impl Into<String>) -> Self {
        BrcError::Strategy { operation, details: details.into(), source: None }
    }

    /// Helper constructor for encoder collaborator failures with source.
    pub fn encoder_with_source(
        context: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BrcError::Encoder { context: context.into(), source: Some(source) }
    }

    /// Helper constructor for encoder collaborator failures.
    pub fn encoder(context: impl Into<String>) -> Self {
        BrcError::Encoder { context: context.into(), source: None }
    }
}

impl From<serde_yaml_ng::Error> for BrcError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        BrcError::Config { context: "YAML deserialization".to_string(), details: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_keep_their_context(
            reason in ".*",
            details in ".*",
          ) {
            let unsupported = BrcError::unsupported(reason.clone());
            let incompatible = BrcError::incompatible(reason.clone());
            let invalid = BrcError::invalid_state(Operation::Update, details.clone());

            prop_assert!(unsupported.to_string().contains(&reason));
            prop_assert!(incompatible.to_string().contains(&reason));
            prop_assert!(invalid.to_string().contains(&details));
            prop_assert!(invalid.to_string().contains("update"));
          }

          #[test]
          fn status_kinds_stay_distinct(reason in "[a-z ]{1,32}") {
            let errors = [
              BrcError::unsupported(reason.clone()),
              BrcError::incompatible(reason.clone()),
              BrcError::invalid_state(Operation::Init, reason.clone()),
            ];
            let flags: Vec<(bool, bool, bool)> = errors
              .iter()
              .map(|e| (e.is_unsupported(), e.requires_reallocation(), e.is_protocol_violation()))
              .collect();

            prop_assert_eq!(flags[0], (true, false, false));
            prop_assert_eq!(flags[1], (false, true, false));
            prop_assert_eq!(flags[2], (false, false, true));
          }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<BrcError>();

        let error = BrcError::strategy(Operation::Update, "test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn fatality_classification() {
        assert!(!BrcError::unsupported("x").is_fatal());
        assert!(!BrcError::incompatible("x").is_fatal());
        assert!(BrcError::invalid_state(Operation::Close, "x").is_fatal());
        assert!(BrcError::strategy(Operation::FrameControl, "x").is_fatal());
        assert!(BrcError::encoder("x").is_fatal());
    }

    #[test]
    fn recovery_suggestions_are_actionable() {
        let errors = [
            BrcError::unsupported("x"),
            BrcError::incompatible("x"),
            BrcError::invalid_state(Operation::Reset, "x"),
            BrcError::encoder("x"),
        ];
        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty());
            for suggestion in &suggestions {
                assert!(suggestion.len() > 5);
            }
        }
    }

    #[test]
    fn encoder_source_is_chained() {
        let io = std::io::Error::other("surface lost");
        let error = BrcError::encoder_with_source("pak failed", Box::new(io));
        let source = std::error::Error::source(&error).expect("source should be chained");
        assert_eq!(source.to_string(), "surface lost");
    }

    #[test]
    fn yaml_errors_convert_to_config() {
        let err = serde_yaml_ng::from_str::<u32>("[not, a, number]").unwrap_err();
        let converted: BrcError = err.into();
        assert!(matches!(converted, BrcError::Config { .. }));
        assert!(converted.is_unsupported());
    }
}
