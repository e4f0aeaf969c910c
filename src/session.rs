//! BRC session: lifecycle and per-frame call ordering.
//!
//! [`BrcSession`] owns the selected [`Strategy`] and enforces the protocol the
//! encoder must follow:
//!
//! ```text
//! Uninitialized ──init──▶ Active ──close──▶ Closed ──init──▶ Active …
//!                          │  ▲
//!                 frame_control / update (attempts 0, 1, 2, … per frame)
//! ```
//!
//! Inside `Active` every frame is a run of attempts. Attempt `n` is proposed with
//! `frame_control`, evaluated with exactly one `update`, and a recode verdict opens
//! attempt `n + 1`. Calls that break this ordering are rejected with
//! [`BrcError::InvalidState`] and leave the session untouched.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::builtin::BuiltinSnapshot;
use crate::config::{BrcConfig, BrcMode, ConfigChange, Resolution};
use crate::controller::RateController;
use crate::strategy::Strategy;
use crate::types::{AttemptKey, BrcStatus, FrameControl, FrameDescriptor, FrameStatus};
use crate::{BrcError, Operation, Result};

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Active,
    /// A rate-controller failure ended the encode; only close is accepted
    Poisoned,
    Closed,
}

/// Per-session frame accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Frames that reached a terminal verdict
    pub frames: u64,
    pub accepted: u64,
    /// Recode verdicts returned
    pub recodes: u64,
    pub skipped: u64,
    pub padded: u64,
    /// Panics imposed by the recode loop after its budget ran out
    pub forced_panics: u64,
    /// Bytes of finished frames, padding included
    pub bytes: u64,
}

impl SessionStats {
    fn record(&mut self, status: &FrameStatus, coded_frame_size: u32) {
        match status.verdict {
            BrcStatus::Accept => {
                self.accepted += 1;
                self.bytes += u64::from(coded_frame_size);
            }
            BrcStatus::RecodeTooBig | BrcStatus::RecodeTooSmall => {
                self.recodes += 1;
                return;
            }
            BrcStatus::PanicTooBig => self.skipped += 1,
            BrcStatus::PanicTooSmall => {
                self.padded += 1;
                self.bytes += u64::from(status.min_frame_size.max(coded_frame_size));
            }
        }
        self.frames += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptPhase {
    /// Frame control issued; update outstanding
    Proposed(AttemptKey),
    /// Recode verdict returned; frame control for `next` is due
    Recoding { next: AttemptKey, verdict: BrcStatus },
}

impl AttemptPhase {
    fn encoded_order(&self) -> u32 {
        match self {
            AttemptPhase::Proposed(key) => key.encoded_order,
            AttemptPhase::Recoding { next, .. } => next.encoded_order,
        }
    }
}

/// Tracks where the encoder is in the attempt sequence.
#[derive(Debug, Clone, Copy, Default)]
struct AttemptCursor {
    last_finished: Option<u32>,
    open: Option<AttemptPhase>,
}

impl AttemptCursor {
    fn admit_proposal(&self, key: AttemptKey) -> std::result::Result<(), String> {
        match self.open {
            None => {
                if key.num_recode != 0 {
                    return Err(format!("frame {} opened at attempt {}", key.encoded_order, key.num_recode));
                }
                match self.last_finished {
                    Some(last) if key.encoded_order <= last => {
                        Err(format!("encoded order {} does not follow finished frame {}", key.encoded_order, last))
                    }
                    _ => Ok(()),
                }
            }
            Some(AttemptPhase::Proposed(open)) if open == key => Ok(()),
            Some(AttemptPhase::Proposed(open)) => {
                Err(format!("frame control for {} while update for {} is outstanding", key, open))
            }
            Some(AttemptPhase::Recoding { next, .. }) if next == key => Ok(()),
            Some(AttemptPhase::Recoding { next, .. }) => {
                Err(format!("frame control for {} but attempt {} is due", key, next))
            }
        }
    }

    fn admit_update(&self, key: AttemptKey) -> std::result::Result<(), String> {
        match self.open {
            Some(AttemptPhase::Proposed(open)) if open == key => Ok(()),
            Some(AttemptPhase::Proposed(open)) => Err(format!("update for {} while {} is outstanding", key, open)),
            Some(AttemptPhase::Recoding { next, .. }) => {
                Err(format!("attempt {} already evaluated; frame control for {} is due", key, next))
            }
            None => Err(format!("update for {} without frame control", key)),
        }
    }

    fn finish(&mut self, encoded_order: u32) {
        self.open = None;
        self.last_finished = Some(encoded_order);
    }
}

struct ActiveSession {
    strategy: Strategy,
    config: BrcConfig,
    allocated: Resolution,
    cursor: AttemptCursor,
    poisoned: Option<String>,
}

impl ActiveSession {
    fn poison(&mut self, operation: Operation, cause: BrcError) -> BrcError {
        error!(%operation, strategy = self.strategy.name(), error = %cause, "Rate controller failed, session poisoned");
        self.poisoned = Some(cause.to_string());
        cause
    }
}

enum Lifecycle {
    Uninitialized,
    Active(Box<ActiveSession>),
    Closed,
}

fn violation(operation: Operation, details: impl Into<String>) -> BrcError {
    let err = BrcError::invalid_state(operation, details);
    error!(%operation, "Protocol violation: {}", err);
    err
}

/// One rate-control session, owned by one encoder.
pub struct BrcSession {
    registered: Option<Box<dyn RateController>>,
    lifecycle: Lifecycle,
    stats: SessionStats,
}

impl Default for BrcSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BrcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrcSession")
            .field("state", &self.state())
            .field("strategy", &self.strategy_name())
            .field("stats", &self.stats)
            .finish()
    }
}

impl BrcSession {
    /// Session without an external controller; only built-in mode can be initialized.
    pub fn new() -> Self {
        Self { registered: None, lifecycle: Lifecycle::Uninitialized, stats: SessionStats::default() }
    }

    /// Session with `controller` registered for external mode.
    pub fn with_external(controller: Box<dyn RateController>) -> Self {
        Self { registered: Some(controller), ..Self::new() }
    }

    /// Register (or replace) the external controller. Only allowed while no
    /// configuration is active.
    pub fn register_external(&mut self, controller: Box<dyn RateController>) -> Result<()> {
        if matches!(self.lifecycle, Lifecycle::Active(_)) {
            return Err(violation(Operation::Init, "cannot register a controller on an active session"));
        }
        debug!(controller = controller.name(), "External rate controller registered");
        self.registered = Some(controller);
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        match &self.lifecycle {
            Lifecycle::Uninitialized => SessionState::Uninitialized,
            Lifecycle::Active(active) if active.poisoned.is_some() => SessionState::Poisoned,
            Lifecycle::Active(_) => SessionState::Active,
            Lifecycle::Closed => SessionState::Closed,
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Active configuration.
    pub fn config(&self) -> Option<&BrcConfig> {
        self.active().map(|active| &active.config)
    }

    pub fn mode(&self) -> Option<BrcMode> {
        self.active().map(|active| active.strategy.mode())
    }

    pub fn strategy_name(&self) -> Option<&str> {
        self.active().map(|active| active.strategy.name())
    }

    /// The attempt whose update (or next frame control) is outstanding.
    pub fn open_attempt(&self) -> Option<AttemptKey> {
        self.active()?.cursor.open.map(|phase| match phase {
            AttemptPhase::Proposed(key) => key,
            AttemptPhase::Recoding { next, .. } => next,
        })
    }

    /// Statistics of the built-in controller, when it is the active strategy.
    pub fn builtin_snapshot(&self) -> Option<BuiltinSnapshot> {
        self.active()?.strategy.as_builtin()?.snapshot()
    }

    fn active(&self) -> Option<&ActiveSession> {
        match &self.lifecycle {
            Lifecycle::Active(active) => Some(&**active),
            _ => None,
        }
    }

    fn active_mut(&mut self, operation: Operation) -> Result<(&mut ActiveSession, &mut SessionStats)> {
        match &mut self.lifecycle {
            Lifecycle::Active(active) => {
                if let Some(cause) = &active.poisoned {
                    return Err(violation(operation, format!("session poisoned by earlier failure: {}", cause)));
                }
                Ok((&mut **active, &mut self.stats))
            }
            Lifecycle::Uninitialized => Err(violation(operation, "session not initialized")),
            Lifecycle::Closed => Err(violation(operation, "session closed")),
        }
    }

    /// Build rate-control state from `config`.
    ///
    /// The configuration is validated first; [`BrcError::Unsupported`] leaves the
    /// session exactly as it was. External mode without a registered controller is
    /// unsupported rather than quietly served by the built-in controller.
    pub fn init(&mut self, config: &BrcConfig) -> Result<()> {
        if matches!(self.lifecycle, Lifecycle::Active(_)) {
            return Err(violation(Operation::Init, "session already initialized; close it first"));
        }

        config.validate()?;
        let mut strategy = Strategy::select(config.mode, &mut self.registered)?;
        if let Err(e) = strategy.init(config) {
            warn!(strategy = strategy.name(), error = %e, "Rate controller rejected configuration");
            self.registered = strategy.into_external();
            return Err(e);
        }

        info!(
            strategy = strategy.name(),
            method = ?config.method,
            target_kbps = config.target_kbps,
            max_kbps = config.peak_kbps(),
            max_recode = config.max_recode,
            "BRC session initialized"
        );

        self.lifecycle = Lifecycle::Active(Box::new(ActiveSession {
            strategy,
            config: config.clone(),
            allocated: config.resolution,
            cursor: AttemptCursor::default(),
            poisoned: None,
        }));
        self.stats = SessionStats::default();
        Ok(())
    }

    /// Apply a new configuration between frames.
    ///
    /// Rejected with [`BrcError::InvalidState`] while a frame is open. Validation
    /// and classification failures keep the previous configuration in force.
    pub fn reset(&mut self, config: &BrcConfig) -> Result<()> {
        let (active, _) = self.active_mut(Operation::Reset)?;
        if let Some(open) = active.cursor.open {
            return Err(violation(
                Operation::Reset,
                format!("frame {} is still open; drain the recode loop first", open.encoded_order()),
            ));
        }

        config.validate()?;
        let change = ConfigChange::classify(&active.allocated, &active.config, config)?;
        debug!(?change, strategy = active.strategy.name(), "Classified reset");

        if let Err(e) = active.strategy.reset(config, change) {
            if e.is_unsupported() || e.requires_reallocation() {
                warn!(error = %e, "Rate controller rejected reset");
                return Err(e);
            }
            return Err(active.poison(Operation::Reset, e));
        }

        active.config = config.clone();
        info!(?change, target_kbps = config.target_kbps, "BRC session reset");
        Ok(())
    }

    /// Release rate-control state.
    ///
    /// Succeeds from the active state, poisoned or not. A registered external
    /// controller is kept for the next init.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Closed) {
            Lifecycle::Active(mut active) => {
                if let Some(open) = active.cursor.open {
                    warn!(frame = open.encoded_order(), "Closing session with a frame still open");
                }
                active.strategy.close();
                info!(
                    strategy = active.strategy.name(),
                    frames = self.stats.frames,
                    recodes = self.stats.recodes,
                    skipped = self.stats.skipped,
                    padded = self.stats.padded,
                    "BRC session closed"
                );
                self.registered = active.strategy.into_external();
                Ok(())
            }
            previous => {
                let details = match previous {
                    Lifecycle::Closed => "session already closed",
                    _ => "session not initialized",
                };
                self.lifecycle = previous;
                Err(violation(Operation::Close, details))
            }
        }
    }

    /// Controls for the attempt in `descriptor`.
    ///
    /// Repeating the call for the outstanding attempt is allowed and returns the
    /// same control. The returned control is always normalized.
    pub fn frame_control(&mut self, descriptor: &FrameDescriptor) -> Result<FrameControl> {
        let operation = Operation::FrameControl;
        let (active, _) = self.active_mut(operation)?;
        if descriptor.frame_type.class().is_none() {
            return Err(violation(
                operation,
                format!("frame type {:#06x} has no coding class", descriptor.frame_type.value()),
            ));
        }

        let key = descriptor.attempt_key();
        active.cursor.admit_proposal(key).map_err(|details| violation(operation, details))?;

        let control = match active.strategy.frame_control(descriptor) {
            Ok(control) => control.normalized(),
            Err(e) => return Err(active.poison(operation, e)),
        };

        trace!(
            frame = key.encoded_order,
            attempt = key.num_recode,
            qp = control.qp_y,
            max_frame_size = control.max_frame_size,
            "Frame control"
        );
        active.cursor.open = Some(AttemptPhase::Proposed(key));
        Ok(control)
    }

    /// Report the coded size of the outstanding attempt and get its verdict.
    pub fn update(&mut self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<FrameStatus> {
        let operation = Operation::Update;
        let (active, stats) = self.active_mut(operation)?;
        let key = descriptor.attempt_key();
        active.cursor.admit_update(key).map_err(|details| violation(operation, details))?;

        let status = match active.strategy.update(descriptor, control) {
            Ok(status) => status,
            Err(e) => return Err(active.poison(operation, e)),
        };

        debug!(
            frame = key.encoded_order,
            attempt = key.num_recode,
            size = descriptor.coded_frame_size,
            qp = control.qp_y,
            verdict = ?status.verdict,
            min_frame_size = status.min_frame_size,
            "Update"
        );

        if status.verdict.is_terminal() {
            active.cursor.finish(key.encoded_order);
        } else {
            let next = AttemptKey { num_recode: key.num_recode.saturating_add(1), ..key };
            active.cursor.open = Some(AttemptPhase::Recoding { next, verdict: status.verdict });
        }
        stats.record(&status, descriptor.coded_frame_size);
        Ok(status)
    }

    /// Close the open frame with a panic verdict the recode loop imposed after
    /// its retry budget ran out.
    ///
    /// `descriptor` is the last evaluated attempt and `verdict` must be the
    /// panic matching the recode verdict it received.
    pub fn abandon(&mut self, descriptor: &FrameDescriptor, verdict: BrcStatus, padded_size: u32) -> Result<()> {
        let operation = Operation::Abandon;
        let (active, stats) = self.active_mut(operation)?;
        let recode_verdict = match active.cursor.open {
            Some(AttemptPhase::Recoding { next, verdict }) if next.encoded_order == descriptor.encoded_order => verdict,
            _ => {
                return Err(violation(
                    operation,
                    format!("frame {} has no pending recode to abandon", descriptor.encoded_order),
                ));
            }
        };
        if verdict != recode_verdict.forced_panic() {
            return Err(violation(
                operation,
                format!("{:?} does not resolve pending {:?}", verdict, recode_verdict),
            ));
        }

        if let Err(e) = active.strategy.abandon_frame(descriptor, verdict, padded_size) {
            return Err(active.poison(operation, e));
        }

        warn!(
            frame = descriptor.encoded_order,
            attempts = u32::from(descriptor.num_recode) + 1,
            ?verdict,
            padded_size,
            "Recode budget exhausted, panic forced"
        );
        active.cursor.finish(descriptor.encoded_order);
        stats.forced_panics += 1;
        let status = match verdict {
            BrcStatus::PanicTooSmall => FrameStatus::pad(padded_size),
            _ => FrameStatus::skip(),
        };
        stats.record(&status, descriptor.coded_frame_size);
        Ok(())
    }
}

/// Shared, serialized access to one [`BrcSession`].
///
/// Every call takes the session lock for its whole duration and releases it on
/// every exit path, so frame control and update never overlap.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<BrcSession>>,
}

impl SessionHandle {
    pub fn new(session: BrcSession) -> Self {
        Self { inner: Arc::new(Mutex::new(session)) }
    }

    /// Lock the session for a sequence of calls.
    ///
    /// A lock poisoned by a panicking holder is reported as
    /// [`BrcError::InvalidState`]; the session may be mid-frame.
    pub fn lock(&self, operation: Operation) -> Result<MutexGuard<'_, BrcSession>> {
        self.inner.lock().map_err(|_| violation(operation, "session lock poisoned by a panicked caller"))
    }

    /// Run `f` with the session locked.
    pub fn with<R>(&self, operation: Operation, f: impl FnOnce(&mut BrcSession) -> Result<R>) -> Result<R> {
        let mut session = self.lock(operation)?;
        f(&mut *session)
    }

    pub fn init(&self, config: &BrcConfig) -> Result<()> {
        self.with(Operation::Init, |session| session.init(config))
    }

    pub fn reset(&self, config: &BrcConfig) -> Result<()> {
        self.with(Operation::Reset, |session| session.reset(config))
    }

    pub fn close(&self) -> Result<()> {
        self.with(Operation::Close, BrcSession::close)
    }

    pub fn frame_control(&self, descriptor: &FrameDescriptor) -> Result<FrameControl> {
        self.with(Operation::FrameControl, |session| session.frame_control(descriptor))
    }

    pub fn update(&self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<FrameStatus> {
        self.with(Operation::Update, |session| session.update(descriptor, control))
    }

    pub fn state(&self) -> Result<SessionState> {
        self.with(Operation::Inspect, |session| Ok(session.state()))
    }

    pub fn stats(&self) -> Result<SessionStats> {
        self.with(Operation::Inspect, |session| Ok(session.stats()))
    }
}

impl From<BrcSession> for SessionHandle {
    fn from(session: BrcSession) -> Self {
        Self::new(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::ScriptedController;
    use crate::test_utils::{ramp_frames, ramp_size, sample_config};
    use crate::types::FrameType;

    fn active_session() -> BrcSession {
        let mut session = BrcSession::new();
        session.init(&sample_config()).unwrap();
        session
    }

    fn external_session(verdicts: Vec<FrameStatus>) -> BrcSession {
        let mut session = BrcSession::with_external(Box::new(ScriptedController::new(verdicts)));
        let config = BrcConfig { mode: BrcMode::External, ..sample_config() };
        session.init(&config).unwrap();
        session
    }

    #[test]
    fn calls_before_init_are_rejected() {
        let mut session = BrcSession::new();
        let frame = FrameDescriptor::new(0, 0, FrameType::idr());

        assert!(session.frame_control(&frame).unwrap_err().is_protocol_violation());
        assert!(session.update(&frame, &FrameControl::with_qp(26)).unwrap_err().is_protocol_violation());
        assert!(session.reset(&sample_config()).unwrap_err().is_protocol_violation());
        assert!(session.close().unwrap_err().is_protocol_violation());
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn rejected_init_keeps_controller_registered() {
        let config = BrcConfig { mode: BrcMode::External, ..sample_config() };
        let mut session = BrcSession::with_external(Box::new(ScriptedController::new(vec![]).rejecting_init()));

        assert!(session.init(&config).unwrap_err().is_unsupported());
        assert_eq!(session.state(), SessionState::Uninitialized);

        // The rejecting controller is still registered and rejects again
        assert!(session.init(&config).unwrap_err().is_unsupported());

        session.register_external(Box::new(ScriptedController::new(vec![]))).unwrap();
        session.init(&config).unwrap();
        assert_eq!(session.strategy_name(), Some("scripted"));
    }

    #[test]
    fn register_external_requires_inactive_session() {
        let mut session = active_session();
        let err = session.register_external(Box::new(ScriptedController::new(vec![]))).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(session.strategy_name(), Some("built-in"));

        // Once closed, a controller can be registered for the next init
        session.close().unwrap();
        session.register_external(Box::new(ScriptedController::new(vec![]))).unwrap();
        session.init(&BrcConfig { mode: BrcMode::External, ..sample_config() }).unwrap();
        assert_eq!(session.mode(), Some(BrcMode::External));
    }

    #[test]
    fn poisoned_handle_reports_inspect_operation() {
        let handle = SessionHandle::new(active_session());
        let poisoner = handle.clone();
        let panicked = std::thread::spawn(move || {
            let _ = poisoner.with(Operation::Update, |_| -> Result<()> { panic!("encoder thread died") });
        })
        .join();
        assert!(panicked.is_err());

        for err in [handle.state().unwrap_err(), handle.stats().map(|_| ()).unwrap_err()] {
            assert!(matches!(err, BrcError::InvalidState { operation: Operation::Inspect, .. }));
        }
        assert!(matches!(
            handle.frame_control(&FrameDescriptor::new(0, 0, FrameType::idr())).unwrap_err(),
            BrcError::InvalidState { operation: Operation::FrameControl, .. }
        ));
    }

    #[test]
    fn lifecycle_round_trip() {
        let mut session = active_session();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.strategy_name(), Some("built-in"));

        let err = session.init(&sample_config()).unwrap_err();
        assert!(err.is_protocol_violation());

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.close().unwrap_err().is_protocol_violation());
        let frame = FrameDescriptor::new(0, 0, FrameType::idr());
        assert!(session.frame_control(&frame).unwrap_err().is_protocol_violation());
        assert!(session.reset(&sample_config()).unwrap_err().is_protocol_violation());

        session.init(&sample_config()).unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn unsupported_config_leaves_session_uninitialized() {
        let mut session = BrcSession::new();
        let config = BrcConfig { target_kbps: 0, ..sample_config() };
        assert!(session.init(&config).unwrap_err().is_unsupported());
        assert_eq!(session.state(), SessionState::Uninitialized);
        session.init(&sample_config()).unwrap();
    }

    #[test]
    fn external_mode_requires_registered_controller() {
        let mut session = BrcSession::new();
        let config = BrcConfig { mode: BrcMode::External, ..sample_config() };
        let err = session.init(&config).unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn external_controller_survives_close() {
        let mut session = external_session(vec![]);
        assert_eq!(session.mode(), Some(BrcMode::External));
        assert_eq!(session.strategy_name(), Some("scripted"));
        session.close().unwrap();

        let config = BrcConfig { mode: BrcMode::External, ..sample_config() };
        session.init(&config).unwrap();
        assert_eq!(session.strategy_name(), Some("scripted"));
    }

    #[test]
    fn attempts_must_be_consecutive() {
        let mut session = external_session(vec![FrameStatus::recode_too_big()]);
        let first = FrameDescriptor::new(0, 0, FrameType::idr());

        // A new frame starts at attempt 0
        let late = first.next_attempt(1000);
        assert!(session.frame_control(&late).unwrap_err().is_protocol_violation());

        let control = session.frame_control(&first).unwrap();
        // Repeating frame control for the open attempt is fine
        assert_eq!(session.frame_control(&first).unwrap(), control);
        // Proposing the next attempt before update is not
        assert!(session.frame_control(&late).unwrap_err().is_protocol_violation());

        let coded = first.with_coded_size(90_000);
        let status = session.update(&coded, &control).unwrap();
        assert_eq!(status.verdict, BrcStatus::RecodeTooBig);
        assert_eq!(session.open_attempt(), Some(AttemptKey { encoded_order: 0, num_recode: 1 }));

        // Double update and skipped attempt numbers are rejected
        assert!(session.update(&coded, &control).unwrap_err().is_protocol_violation());
        let gap = coded.next_attempt(1).next_attempt(1);
        assert!(session.frame_control(&gap).unwrap_err().is_protocol_violation());

        let retry = coded.next_attempt(90_000);
        let control = session.frame_control(&retry).unwrap();
        let status = session.update(&retry.with_coded_size(40_000), &control).unwrap();
        assert_eq!(status.verdict, BrcStatus::Accept);
        assert_eq!(session.open_attempt(), None);
        assert_eq!(session.stats().recodes, 1);
        assert_eq!(session.stats().accepted, 1);
    }

    #[test]
    fn encoded_order_must_increase() {
        let mut session = external_session(vec![]);
        let frame = FrameDescriptor::new(5, 5, FrameType::idr());
        let control = session.frame_control(&frame).unwrap();
        session.update(&frame.with_coded_size(1000), &control).unwrap();

        let stale = FrameDescriptor::new(5, 6, FrameType::predicted());
        assert!(session.frame_control(&stale).unwrap_err().is_protocol_violation());
        let next = FrameDescriptor::new(6, 6, FrameType::predicted());
        session.frame_control(&next).unwrap();
    }

    #[test]
    fn update_without_frame_control_is_rejected() {
        let mut session = active_session();
        let frame = FrameDescriptor::new(0, 0, FrameType::idr());
        let err = session.update(&frame.with_coded_size(1000), &FrameControl::with_qp(26)).unwrap_err();
        assert!(err.is_protocol_violation());
        // The rejected call did not disturb the session
        assert_eq!(session.state(), SessionState::Active);
        session.frame_control(&frame).unwrap();
    }

    #[test]
    fn unknown_frame_class_is_rejected() {
        let mut session = active_session();
        let frame = FrameDescriptor::new(0, 0, FrameType::new(crate::types::frame_flags::REF));
        assert!(session.frame_control(&frame).unwrap_err().is_protocol_violation());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn controls_are_normalized() {
        let mut unbounded = FrameControl::with_qp(30).with_repack(50_000, &[3, 3]);
        unbounded.max_frame_size = 0;
        let controller = ScriptedController::new(vec![]).with_control(unbounded);
        let mut session = BrcSession::with_external(Box::new(controller));
        session.init(&BrcConfig { mode: BrcMode::External, ..sample_config() }).unwrap();

        let control = session.frame_control(&FrameDescriptor::new(0, 0, FrameType::idr())).unwrap();
        assert_eq!(control.max_num_repak, 0);
        assert_eq!(control.delta_qp, [0; 8]);
    }

    #[test]
    fn strategy_failure_poisons_session() {
        let controller = ScriptedController::new(vec![]).failing_at_update(1);
        let mut session = BrcSession::with_external(Box::new(controller));
        let config = BrcConfig { mode: BrcMode::External, ..sample_config() };
        session.init(&config).unwrap();

        let frames = ramp_frames(3);
        let control = session.frame_control(&frames[0]).unwrap();
        session.update(&frames[0].with_coded_size(ramp_size(&frames[0])), &control).unwrap();
        let control = session.frame_control(&frames[1]).unwrap();
        let err = session.update(&frames[1].with_coded_size(ramp_size(&frames[1])), &control).unwrap_err();
        assert!(matches!(err, BrcError::Strategy { .. }));
        assert_eq!(session.state(), SessionState::Poisoned);

        assert!(session.frame_control(&frames[2]).unwrap_err().is_protocol_violation());
        assert!(session.reset(&config).unwrap_err().is_protocol_violation());

        session.close().unwrap();
        session.init(&config).unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn reset_is_rejected_mid_frame() {
        let mut session = active_session();
        let frame = FrameDescriptor::new(0, 0, FrameType::idr());
        session.frame_control(&frame).unwrap();
        let err = session.reset(&sample_config()).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn reset_classification_errors_keep_previous_config() {
        let mut session = active_session();

        let mut grown = sample_config();
        grown.resolution.width *= 2;
        assert!(session.reset(&grown).unwrap_err().requires_reallocation());

        let switched = BrcConfig { mode: BrcMode::External, ..sample_config() };
        assert!(session.reset(&switched).unwrap_err().requires_reallocation());

        let broken = BrcConfig { max_kbps: 1, ..sample_config() };
        assert!(session.reset(&broken).unwrap_err().is_unsupported());

        assert_eq!(session.config(), Some(&sample_config()));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn identical_reset_matches_uninterrupted_session() {
        let frames = ramp_frames(12);
        let mut uninterrupted = active_session();
        let mut reset = active_session();

        for (index, frame) in frames.iter().enumerate() {
            if index == 6 {
                reset.reset(&sample_config()).unwrap();
            }
            let expected = uninterrupted.frame_control(frame).unwrap();
            let actual = reset.frame_control(frame).unwrap();
            assert_eq!(expected, actual, "frame {}", index);
            let coded = frame.with_coded_size(ramp_size(frame));
            uninterrupted.update(&coded, &expected).unwrap();
            reset.update(&coded, &actual).unwrap();
        }
        assert_eq!(uninterrupted.builtin_snapshot(), reset.builtin_snapshot());
    }

    #[test]
    fn abandon_requires_pending_recode() {
        let mut session = external_session(vec![FrameStatus::recode_too_small()]);
        let first = FrameDescriptor::new(0, 0, FrameType::idr());
        let frame = first.with_coded_size(500);

        assert!(session.abandon(&frame, BrcStatus::PanicTooSmall, 800).unwrap_err().is_protocol_violation());

        let control = session.frame_control(&first).unwrap();
        session.update(&frame, &control).unwrap();

        // The panic must match the recode direction
        assert!(session.abandon(&frame, BrcStatus::PanicTooBig, 0).unwrap_err().is_protocol_violation());
        session.abandon(&frame, BrcStatus::PanicTooSmall, 800).unwrap();

        let stats = session.stats();
        assert_eq!(stats.forced_panics, 1);
        assert_eq!(stats.padded, 1);
        assert_eq!(stats.bytes, 800);
        assert_eq!(session.open_attempt(), None);
    }

    #[test]
    fn handle_serializes_calls_across_threads() {
        let handle = SessionHandle::new(BrcSession::new());
        handle.init(&sample_config()).unwrap();

        let worker = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                for frame in ramp_frames(8) {
                    let control = handle.frame_control(&frame).unwrap();
                    handle.update(&frame.with_coded_size(ramp_size(&frame)), &control).unwrap();
                }
            })
        };
        worker.join().unwrap();

        assert_eq!(handle.stats().unwrap().frames, 8);
        handle.close().unwrap();
        assert_eq!(handle.state().unwrap(), SessionState::Closed);
    }
}
