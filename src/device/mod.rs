//! Accelerator abstraction.
//!
//! A [`Device`] owns a memory domain disjoint from the host. Everything that
//! lives there is named by a [`DeviceAddress`], an opaque handle that host code
//! can pass to device APIs but never dereference.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

pub mod image;
pub mod kernels;
pub mod simulated;
pub mod stream;

pub use kernels::{DeviceKernel, KernelArgs, KernelSymbol};
pub use simulated::SimulatedDevice;
pub use stream::{DeviceStream, LaunchHandle};

/// Address in device memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    /// The null device address.
    pub const NULL: Self = Self(0);

    /// Wraps a raw device address.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value, for writing into device images.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True for [`DeviceAddress::NULL`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddress({self})")
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One mechanism evaluated by a step launch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaunchEntry {
    /// Device mirror of the mechanism.
    pub mechanism: DeviceAddress,
    /// Source compartment potential at `step - 1`.
    pub pre_potential: f64,
    /// Owning compartment potential at `step - 1`.
    pub post_potential: f64,
}

/// A data-parallel launch of the mechanism step over mirrored mechanisms.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLaunch {
    /// Integration step size.
    pub dt: f64,
    /// Simulated time of this step.
    pub global_time: f64,
    /// Step index being computed.
    pub step: usize,
    /// One entry per mechanism; each must name a distinct mirror.
    pub entries: Vec<LaunchEntry>,
}

/// Accelerator backend.
///
/// Implementations are shared across threads; every method takes `&self`.
pub trait Device: Send + Sync + fmt::Debug {
    /// Device name for diagnostics.
    fn name(&self) -> &str;

    /// True if the device can be used.
    fn is_available(&self) -> bool;

    /// Allocates `len` bytes of device memory.
    fn allocate(&self, len: usize) -> Result<DeviceAddress, DeviceError>;

    /// Releases an allocation made by [`Device::allocate`].
    fn free(&self, address: DeviceAddress) -> Result<(), DeviceError>;

    /// Copies `bytes` into device memory at `address`.
    fn copy_to_device(&self, address: DeviceAddress, bytes: &[u8]) -> Result<(), DeviceError>;

    /// Copies `len` bytes out of device memory at `address`.
    fn copy_from_device(&self, address: DeviceAddress, len: usize) -> Result<Vec<u8>, DeviceError>;

    /// Reads the address stored in a device symbol.
    fn read_symbol(&self, symbol: &str) -> Result<DeviceAddress, DeviceError>;

    /// Stores an address in a device symbol, creating it if needed.
    fn write_symbol(&self, symbol: &str, value: DeviceAddress) -> Result<(), DeviceError>;

    /// Runs the mechanism step for every entry and returns the currents in
    /// entry order.
    fn launch(&self, launch: &StepLaunch) -> Result<Vec<f64>, DeviceError>;
}
