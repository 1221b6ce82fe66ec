//! Device-side code: the mechanism step counterparts a device can execute.
//!
//! Every kernel operates on the device image of exactly one mechanism. It may
//! write its own trace at `step` and must read only `step - 1`.

use std::fmt;

use crate::error::DeviceError;
use crate::mechanism::{leak, synapse, MechanismBase};

/// Per-launch scalar arguments handed to every kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelArgs {
    /// Source compartment potential at `step - 1`.
    pub pre_potential: f64,
    /// Owning compartment potential at `step - 1`.
    pub post_potential: f64,
    /// Integration step size.
    pub dt: f64,
    /// Simulated time of this step.
    pub global_time: f64,
    /// Step index being computed.
    pub step: usize,
}

/// Device entry point for the mechanism step: `(object image, args) -> current`.
pub type DeviceKernel = fn(&mut [u8], &KernelArgs) -> Result<f64, DeviceError>;

/// A kernel together with the device symbol that publishes its address.
#[derive(Clone, Copy)]
pub struct KernelSymbol {
    /// Device symbol holding the kernel's address.
    pub symbol: &'static str,
    /// The kernel.
    pub kernel: DeviceKernel,
}

impl fmt::Debug for KernelSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSymbol")
            .field("symbol", &self.symbol)
            .finish_non_exhaustive()
    }
}

/// Offset of the first subclass field in a mechanism image.
pub const MECHANISM_FIELDS_OFFSET: usize = MechanismBase::IMAGE_LEN;

/// Kernels shipped with the runtime.
#[must_use]
pub fn builtin() -> Vec<KernelSymbol> {
    vec![
        KernelSymbol {
            symbol: crate::mechanism::DEFAULT_STEP_DEVICE_SYMBOL,
            kernel: default_step,
        },
        KernelSymbol {
            symbol: synapse::STEP_DEVICE_SYMBOL,
            kernel: synapse::device_step,
        },
        KernelSymbol {
            symbol: leak::STEP_DEVICE_SYMBOL,
            kernel: leak::device_step,
        },
    ]
}

/// Device counterpart of the identity mechanism step.
fn default_step(_image: &mut [u8], _args: &KernelArgs) -> Result<f64, DeviceError> {
    Ok(0.0)
}

/// Checks that `step` can be computed on a trace of `len` values.
pub fn check_step(step: usize, len: usize) -> Result<(), DeviceError> {
    if step == 0 || step >= len {
        return Err(DeviceError::LaunchFailed {
            reason: format!("step {step} is outside a device trace of length {len}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_symbols_are_distinct() {
        let kernels = builtin();
        let mut symbols: Vec<_> = kernels.iter().map(|k| k.symbol).collect();
        symbols.sort_unstable();
        symbols.dedup();
        assert_eq!(symbols.len(), kernels.len());
    }

    #[test]
    fn default_kernel_contributes_nothing() {
        let args = KernelArgs {
            pre_potential: -60.0,
            post_potential: -70.0,
            dt: 0.1,
            global_time: 0.1,
            step: 1,
        };
        assert_eq!(default_step(&mut [], &args).unwrap(), 0.0);
    }

    #[test]
    fn step_bounds() {
        assert!(check_step(0, 10).is_err());
        assert!(check_step(1, 10).is_ok());
        assert!(check_step(9, 10).is_ok());
        assert!(check_step(10, 10).is_err());
    }
}
