//! External bitrate-control feedback protocol for video encoders.
//!
//! extbrc lets a video encoder hand its rate-control decisions to a pluggable
//! controller through a small, strictly ordered feedback protocol.
//!
//! # Features
//!
//! - **Session lifecycle**: init, reset and close with configuration validation
//!   and reset classification
//! - **Attempt protocol**: frame control and update per coding attempt, with
//!   recode, skip and pad verdicts
//! - **Built-in controller**: leaky-bucket HRD model with a per-class QP model
//! - **Pluggable controllers**: any [`RateController`] selected through [`BrcMode::External`]
//! - **Async driver**: a tokio task feeding frames from a [`FrameSource`] through the recode loop
//!
//! # Quick Start
//!
//! ```rust
//! use extbrc::config::{BrcConfig, FrameRate, Resolution};
//! use extbrc::types::{FrameDescriptor, FrameType};
//! use extbrc::Brc;
//!
//! # fn main() -> extbrc::Result<()> {
//! let config = BrcConfig::cbr(4_000, FrameRate { num: 30, den: 1 }, Resolution { width: 1920, height: 1080 }, 3);
//! let mut session = Brc::builtin(&config)?;
//!
//! let frame = FrameDescriptor::new(0, 0, FrameType::idr());
//! let control = session.frame_control(&frame)?;
//!
//! // ... encode the frame at control.qp_y ...
//! let status = session.update(&frame.with_coded_size(40_000), &control)?;
//! assert!(status.verdict.is_terminal());
//!
//! session.close()?;
//! # Ok(())
//! # }
//! ```

// Core types and error handling
pub mod config;
mod controller;
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Rate control
pub mod builtin;
pub mod conformance;
pub mod session;
pub mod strategy;

// Encoder side
pub mod driver;
pub mod recode;
pub mod repack;
pub mod source;

// Core exports
pub use controller::RateController;
pub use error::*;
pub use types::*;

// Main API exports
pub use config::{BrcConfig, BrcMode, ConfigChange, RateControlMethod};
pub use driver::{DriverChannels, DriverExit, DriverOptions, DriverSummary, EncodeDriver};
pub use recode::{FrameCoder, FrameOutcome, FrameReport, LoopState, RecodeBudget, RecodeLoop};
pub use repack::{CodedFrame, encode_with_repack};
pub use session::{BrcSession, SessionHandle, SessionState, SessionStats};
pub use source::{FrameSource, QueuedSource};
pub use strategy::Strategy;

/// Unified entry point for rate-control sessions.
///
/// # Examples
///
/// ## Built-in rate control
/// ```rust
/// use extbrc::config::{BrcConfig, FrameRate, Resolution};
/// use extbrc::Brc;
///
/// # fn main() -> extbrc::Result<()> {
/// let config = BrcConfig::cbr(2_000, FrameRate { num: 25, den: 1 }, Resolution { width: 1280, height: 720 }, 2);
/// let session = Brc::builtin(&config)?;
/// assert_eq!(session.strategy_name(), Some("built-in"));
/// # Ok(())
/// # }
/// ```
///
/// ## External rate control
/// ```rust
/// use extbrc::config::{BrcConfig, BrcMode, FrameRate, Resolution};
/// use extbrc::conformance::ScriptedController;
/// use extbrc::Brc;
///
/// # fn main() -> extbrc::Result<()> {
/// let mut config = BrcConfig::cbr(2_000, FrameRate { num: 25, den: 1 }, Resolution { width: 1280, height: 720 }, 2);
/// config.mode = BrcMode::External;
/// let session = Brc::external(ScriptedController::new(vec![]), &config)?;
/// assert_eq!(session.strategy_name(), Some("scripted"));
/// # Ok(())
/// # }
/// ```
pub struct Brc;

impl Brc {
    /// Open a session using the built-in controller.
    ///
    /// # Errors
    ///
    /// Returns [`BrcError::Unsupported`] if the configuration fails validation
    /// or asks for external rate control.
    pub fn builtin(config: &BrcConfig) -> Result<BrcSession> {
        let mut session = BrcSession::new();
        session.init(config)?;
        Ok(session)
    }

    /// Open a session driven by `controller`.
    ///
    /// `config.mode` must be [`BrcMode::External`]; the controller stays
    /// registered with the session across close and init.
    pub fn external<C: RateController>(controller: C, config: &BrcConfig) -> Result<BrcSession> {
        let mut session = BrcSession::with_external(Box::new(controller));
        session.init(config)?;
        Ok(session)
    }

    /// Open a session from a YAML configuration document.
    ///
    /// `controller` is registered for external mode and ignored otherwise.
    pub fn from_yaml(yaml: &str, controller: Option<Box<dyn RateController>>) -> Result<BrcSession> {
        let config = BrcConfig::from_yaml(yaml)?;
        let mut session = match controller {
            Some(controller) => BrcSession::with_external(controller),
            None => BrcSession::new(),
        };
        session.init(&config)?;
        Ok(session)
    }

    /// Wrap a session for shared use across tasks or threads.
    pub fn shared(session: BrcSession) -> SessionHandle {
        SessionHandle::new(session)
    }
}
