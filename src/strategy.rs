//! Rate-control capability selected at configuration time

use tracing::debug;

use crate::builtin::BuiltinController;
use crate::config::{BrcConfig, BrcMode, ConfigChange};
use crate::controller::RateController;
use crate::types::{BrcStatus, FrameControl, FrameDescriptor, FrameStatus};
use crate::{BrcError, Result};

/// Either the built-in controller or an externally supplied one.
pub enum Strategy {
    BuiltIn(BuiltinController),
    External(Box<dyn RateController>),
}

impl Strategy {
    /// Pick the strategy for `mode`.
    ///
    /// External mode takes the registered controller out of `external`; when
    /// none is registered the configuration is rejected rather than silently
    /// falling back to built-in rate control.
    pub fn select(mode: BrcMode, external: &mut Option<Box<dyn RateController>>) -> Result<Self> {
        match mode {
            BrcMode::BuiltIn => Ok(Strategy::BuiltIn(BuiltinController::new())),
            BrcMode::External => match external.take() {
                Some(controller) => {
                    debug!(controller = controller.name(), "Selected external rate control");
                    Ok(Strategy::External(controller))
                }
                None => Err(BrcError::unsupported("external rate control requested but no controller registered")),
            },
        }
    }

    pub fn mode(&self) -> BrcMode {
        match self {
            Strategy::BuiltIn(_) => BrcMode::BuiltIn,
            Strategy::External(_) => BrcMode::External,
        }
    }

    pub fn as_builtin(&self) -> Option<&BuiltinController> {
        match self {
            Strategy::BuiltIn(controller) => Some(controller),
            Strategy::External(_) => None,
        }
    }

    /// Give back the external controller so it can be registered again.
    pub fn into_external(self) -> Option<Box<dyn RateController>> {
        match self {
            Strategy::BuiltIn(_) => None,
            Strategy::External(controller) => Some(controller),
        }
    }

    fn inner(&self) -> &dyn RateController {
        match self {
            Strategy::BuiltIn(controller) => controller,
            Strategy::External(controller) => controller.as_ref(),
        }
    }

    fn inner_mut(&mut self) -> &mut dyn RateController {
        match self {
            Strategy::BuiltIn(controller) => controller,
            Strategy::External(controller) => controller.as_mut(),
        }
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Strategy").field(&self.inner().name()).finish()
    }
}

impl RateController for Strategy {
    fn init(&mut self, config: &BrcConfig) -> Result<()> {
        self.inner_mut().init(config)
    }

    fn reset(&mut self, config: &BrcConfig, change: ConfigChange) -> Result<()> {
        self.inner_mut().reset(config, change)
    }

    fn close(&mut self) {
        self.inner_mut().close()
    }

    fn frame_control(&self, descriptor: &FrameDescriptor) -> Result<FrameControl> {
        self.inner().frame_control(descriptor)
    }

    fn update(&mut self, descriptor: &FrameDescriptor, control: &FrameControl) -> Result<FrameStatus> {
        self.inner_mut().update(descriptor, control)
    }

    fn abandon_frame(&mut self, descriptor: &FrameDescriptor, verdict: BrcStatus, padded_size: u32) -> Result<()> {
        self.inner_mut().abandon_frame(descriptor, verdict, padded_size)
    }

    fn name(&self) -> &str {
        self.inner().name()
    }
}
