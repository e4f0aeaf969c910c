//! Protocol conformance checking.
//!
//! [`ConformanceMonitor`] wraps any [`RateController`] and records every call it
//! receives in a [`ProtocolTrace`]. Calls that break the attempt protocol are
//! recorded as [`Violation`]s and still forwarded, so the monitor can sit under a
//! session or be driven directly by an encoder under test.
//!
//! [`ScriptedController`] is a synthetic controller that answers updates from a
//! fixed verdict script.
//!
//! ```rust
//! use extbrc::conformance::{ConformanceMonitor, ScriptedController};
//! use extbrc::types::{FrameDescriptor, FrameStatus, FrameType};
//! use extbrc::RateController;
//!
//! let mut monitor = ConformanceMonitor::new(ScriptedController::new(vec![FrameStatus::accept()]));
//! let trace = monitor.trace();
//!
//! let frame = FrameDescriptor::new(0, 0, FrameType::idr());
//! let control = monitor.frame_control(&frame).unwrap();
//! monitor.update(&frame.with_coded_size(4_000), &control).unwrap();
//!
//! assert!(trace.is_conformant());
//! assert_eq!(trace.update_count(), 1);
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::{BrcConfig, ConfigChange};
use crate::controller::RateController;
use crate::types::{AttemptKey, BrcStatus, FrameControl, FrameDescriptor, FrameStatus};
use crate::{BrcError, Operation, Result};

/// One call seen by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolCall {
    Init,
    Reset,
    Close,
    FrameControl { key: AttemptKey, control: Option<FrameControl> },
    Update { key: AttemptKey, coded_frame_size: u32, verdict: Option<BrcStatus> },
    Abandon { key: AttemptKey, verdict: BrcStatus, padded_size: u32 },
}

/// A broken protocol rule.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Violation {
    #[error("attempt {got} does not follow attempt numbering; expected {expected}")]
    NonConsecutiveAttempt { expected: AttemptKey, got: AttemptKey },

    #[error("update for {0} received more than once")]
    DuplicateUpdate(AttemptKey),

    #[error("update for {0} without a preceding frame control")]
    UpdateWithoutFrameControl(AttemptKey),

    #[error("frame control for {got} before update for {pending}")]
    FrameControlBeforeUpdate { pending: AttemptKey, got: AttemptKey },

    #[error("encoded order {got} after {previous}")]
    EncodeOrderRegression { previous: u32, got: u32 },

    #[error("frame control for {0} carries repack fields without a max frame size")]
    RepackWithoutBudget(AttemptKey),

    #[error("{operation} outside an initialized session")]
    NotInitialized { operation: String },
}

#[derive(Debug, Default)]
struct TraceLog {
    calls: Vec<ProtocolCall>,
    violations: Vec<Violation>,
    initialized: bool,
    /// Attempt proposed and awaiting update
    proposed: Option<AttemptKey>,
    /// Next attempt expected after a recode verdict
    expected: Option<AttemptKey>,
    last_encoded: Option<u32>,
    updated: HashSet<AttemptKey>,
}

impl TraceLog {
    fn violate(&mut self, violation: Violation) {
        warn!(%violation, "Protocol violation observed");
        self.violations.push(violation);
    }

    fn require_init(&mut self, operation: Operation) {
        if !self.initialized {
            self.violate(Violation::NotInitialized { operation: operation.to_string() });
        }
    }

    fn observe_frame_control(&mut self, key: AttemptKey) {
        self.require_init(Operation::FrameControl);
        if let Some(pending) = self.proposed {
            if pending != key {
                self.violate(Violation::FrameControlBeforeUpdate { pending, got: key });
            }
            return;
        }

        match self.expected {
            Some(expected) if expected != key => {
                self.violate(Violation::NonConsecutiveAttempt { expected, got: key })
            }
            Some(_) => {}
            None => {
                if key.num_recode != 0 {
                    let expected = AttemptKey { num_recode: 0, ..key };
                    self.violate(Violation::NonConsecutiveAttempt { expected, got: key });
                }
                if let Some(previous) = self.last_encoded.filter(|previous| key.encoded_order <= *previous) {
                    self.violate(Violation::EncodeOrderRegression { previous, got: key.encoded_order });
                }
            }
        }
        self.proposed = Some(key);
    }

    fn observe_update(&mut self, key: AttemptKey) {
        self.require_init(Operation::Update);
        if !self.updated.insert(key) {
            self.violate(Violation::DuplicateUpdate(key));
        } else if self.proposed != Some(key) {
            self.violate(Violation::UpdateWithoutFrameControl(key));
        }
    }

    fn settle(&mut self, key: AttemptKey, verdict: BrcStatus) {
        self.proposed = None;
        if verdict.is_terminal() {
            self.finish(key.encoded_order);
        } else {
            self.expected = Some(AttemptKey { num_recode: key.num_recode.saturating_add(1), ..key });
        }
    }

    fn finish(&mut self, encoded_order: u32) {
        self.expected = None;
        self.last_encoded = Some(encoded_order);
    }
}

/// Shared view of everything a [`ConformanceMonitor`] observed.
#[derive(Debug, Clone, Default)]
pub struct ProtocolTrace {
    log: Arc<Mutex<TraceLog>>,
}

impl ProtocolTrace {
    fn log(&self) -> MutexGuard<'_, TraceLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<ProtocolCall> {
        self.log().calls.clone()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.log().violations.clone()
    }

    pub fn is_conformant(&self) -> bool {
        self.log().violations.is_empty()
    }

    pub fn update_count(&self) -> usize {
        self.log().calls.iter().filter(|call| matches!(call, ProtocolCall::Update { .. })).count()
    }

    /// `num_recode` of every update for one frame, in call order.
    pub fn attempts_for(&self, encoded_order: u32) -> Vec<u16> {
        self.log()
            .calls
            .iter()
            .filter_map(|call| match call {
                ProtocolCall::Update { key, .. } if key.encoded_order == encoded_order => Some(key.num_recode),
                _ => None,
            })
            .collect()
    }

    /// Verdicts returned for one frame, in call order.
    pub fn verdicts_for(&self, encoded_order: u32) -> Vec<BrcStatus> {
        self.log()
            .calls
            .iter()
            .filter_map(|call| match call {
                ProtocolCall::Update { key, verdict, .. } if key.encoded_order == encoded_order => *verdict,
                _ => None,
            })
            .collect()
    }
}

/// Records and checks every call made to the wrapped controller.
#[derive(Debug)]
pub struct ConformanceMonitor<C> {
    inner: C,
    trace: ProtocolTrace,
}

impl<C: RateController> ConformanceMonitor<C> {
    pub fn new(inner: C) -> Self {
        Self { inner, trace: ProtocolTrace::default() }
    }

    /// A handle to the trace that stays valid after the monitor is boxed.
    pub fn trace(&self) -> ProtocolTrace {
        self.trace.clone()
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: RateController> RateController for ConformanceMonitor<C> {
    fn init(&mut self, config: &BrcConfig) -> Result<()> {
        let result = self.inner.init(config);
        let mut log = self.trace.log();
        log.calls.push(ProtocolCall::Init);
        if result.is_ok() {
            log.initialized = true;
            log.proposed = None;
            log.expected = None;
            log.last_encoded = None;
            log.updated.clear();
        }
        result
    }

    fn reset(&mut self, config: &BrcConfig, change: ConfigChange) -> Result<()> {
        {
            let mut log = self.trace.log();
            log.calls.push(ProtocolCall::Reset);
            log.require_init(Operation::Reset);
        }
        self.inner.reset(config, change)
    }

    fn close(&mut self) {
        {
            let mut log = self.trace.log();
            log.calls.push(ProtocolCall::Close);
            log.initialized = false;
        }
        self.inner.close()
    }

    fn frame_control(&self, descriptor: &FrameDescriptor) -> Result<FrameControl> {
        let key = descriptor.attempt_key();
        self.trace.log().observe_frame_control(key);

        let result = self.inner.frame_control(descriptor);
        let mut log = self.trace.log();
        if let Ok(control) = &result {
            if !control.is_normalized() && control.max_frame_size == 0 {
                log.violate(Violation::RepackWithoutBudget(key));
            }
        }
        log.calls.push(ProtocolCall::FrameControl { key, control: result.as_ref().ok().copied() });
        result
    }

    fn update(&mut self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<FrameStatus> {
        let key = descriptor.attempt_key();
        self.trace.log().observe_update(key);

        let result = self.inner.update(descriptor, control);
        let mut log = self.trace.log();
        log.calls.push(ProtocolCall::Update {
            key,
            coded_frame_size: descriptor.coded_frame_size,
            verdict: result.as_ref().ok().map(|status| status.verdict),
        });
        if let Ok(status) = &result {
            log.settle(key, status.verdict);
        }
        result
    }

    fn abandon_frame(&mut self, descriptor: &FrameDescriptor, verdict: BrcStatus, padded_size: u32) -> Result<()> {
        {
            let mut log = self.trace.log();
            log.calls.push(ProtocolCall::Abandon { key: descriptor.attempt_key(), verdict, padded_size });
            log.finish(descriptor.encoded_order);
        }
        self.inner.abandon_frame(descriptor, verdict, padded_size)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Synthetic controller answering updates from a verdict script.
///
/// Once the script runs out every update is accepted.
#[derive(Debug, Clone)]
pub struct ScriptedController {
    script: VecDeque<FrameStatus>,
    control: FrameControl,
    fail_at_update: Option<u64>,
    reject_init: bool,
    updates: u64,
    initialized: bool,
}

impl ScriptedController {
    pub fn new(script: impl IntoIterator<Item = FrameStatus>) -> Self {
        Self {
            script: script.into_iter().collect(),
            control: FrameControl::with_qp(26),
            fail_at_update: None,
            reject_init: false,
            updates: 0,
            initialized: false,
        }
    }

    /// Return `control` from every frame control call.
    pub fn with_control(mut self, control: FrameControl) -> Self {
        self.control = control;
        self
    }

    /// Fail the update with this zero-based index.
    pub fn failing_at_update(mut self, index: u64) -> Self {
        self.fail_at_update = Some(index);
        self
    }

    /// Reject every configuration as unsupported.
    pub fn rejecting_init(mut self) -> Self {
        self.reject_init = true;
        self
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl RateController for ScriptedController {
    fn init(&mut self, _config: &BrcConfig) -> Result<()> {
        if self.reject_init {
            return Err(BrcError::unsupported("scripted controller rejects every configuration"));
        }
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self, _config: &BrcConfig, _change: ConfigChange) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.initialized = false;
    }

    fn frame_control(&self, _descriptor: &FrameDescriptor) -> Result<FrameControl> {
        if !self.initialized {
            return Err(BrcError::strategy(Operation::FrameControl, "scripted controller not initialized"));
        }
        Ok(self.control)
    }

    fn update(&mut self, _descriptor: &FrameDescriptor, _control: &FrameControl) -> Result<FrameStatus> {
        let index = self.updates;
        self.updates += 1;
        if self.fail_at_update == Some(index) {
            return Err(BrcError::strategy(Operation::Update, format!("scripted failure at update {}", index)));
        }
        Ok(self.script.pop_front().unwrap_or_else(FrameStatus::accept))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
