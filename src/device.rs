use tracing::{debug, trace};

use crate::error::EngineError;

/// Execution device controls the driver needs around timed work.
pub trait Device {
    fn name(&self) -> &str;

    /// Blocks until all dispatched work has completed.
    fn synchronize(&self) -> Result<(), EngineError>;

    /// Releases cached allocations.
    fn empty_cache(&self);

    /// Toggles the backend's kernel autotuning heuristics.
    fn set_autotune(&self, enabled: bool);
}

/// Host execution: every op completes before it returns, so synchronize is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuDevice;

impl Device for CpuDevice {
    fn name(&self) -> &str {
        "cpu"
    }

    fn synchronize(&self) -> Result<(), EngineError> {
        trace!("cpu synchronize");
        Ok(())
    }

    fn empty_cache(&self) {
        trace!("cpu empty_cache");
    }

    fn set_autotune(&self, enabled: bool) {
        debug!(enabled, "cpu autotune");
    }
}
