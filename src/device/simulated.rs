//! In-process accelerator with its own address space.
//!
//! `SimulatedDevice` keeps device memory in a map keyed by base address,
//! starting at the configured heap base so device addresses never coincide
//! with host pointers in practice. Kernels are loaded at code addresses in a
//! separate range and published through device symbols, so host code only
//! ever learns a kernel's address by reading a symbol.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use rayon::prelude::*;
use tracing::{debug, instrument, trace};

use crate::class::Selector;
use crate::config::DeviceConfig;
use crate::device::image::{read_u64_at, ClassImage};
use crate::device::kernels::{self, DeviceKernel, KernelArgs, KernelSymbol};
use crate::device::{Device, DeviceAddress, StepLaunch};
use crate::error::DeviceError;

const CODE_BASE: u64 = 0x0000_c0de_0000;
const CODE_STRIDE: u64 = 0x100;

fn lock_err(context: &'static str) -> DeviceError {
    DeviceError::LaunchFailed {
        reason: format!("poisoned device lock: {context}"),
    }
}

#[derive(Debug, Default)]
struct DeviceMemory {
    allocations: BTreeMap<u64, Vec<u8>>,
    next: u64,
    used: usize,
    symbols: HashMap<String, DeviceAddress>,
    code: HashMap<DeviceAddress, (&'static str, DeviceKernel)>,
}

impl DeviceMemory {
    /// Finds the allocation containing `[address, address + len)`.
    fn locate(&self, address: DeviceAddress, len: usize) -> Result<(u64, usize), DeviceError> {
        let raw = address.raw();
        let (&base, bytes) = self
            .allocations
            .range(..=raw)
            .next_back()
            .ok_or(DeviceError::InvalidAddress { address })?;
        let offset = usize::try_from(raw - base).map_err(|_| DeviceError::InvalidAddress { address })?;
        if offset > bytes.len() {
            return Err(DeviceError::InvalidAddress { address });
        }
        if offset + len > bytes.len() {
            return Err(DeviceError::TransferFailed {
                address,
                len,
                reason: format!(
                    "range ends {} bytes past the allocation",
                    offset + len - bytes.len()
                ),
            });
        }
        Ok((base, offset))
    }

    fn resolve_step_kernel(&self, object: DeviceAddress) -> Result<DeviceKernel, DeviceError> {
        let image = self
            .allocations
            .get(&object.raw())
            .ok_or(DeviceError::InvalidAddress { address: object })?;
        let class = DeviceAddress::from_raw(read_u64_at(image, 0)?);
        let class_image = self
            .allocations
            .get(&class.raw())
            .ok_or(DeviceError::InvalidAddress { address: class })?;
        let class_image = ClassImage::decode(class_image)?;

        let entry = class_image
            .slot(Selector::MechanismStep)
            .ok_or_else(|| DeviceError::LaunchFailed {
                reason: format!("device class at {class} has no mechanism_step slot"),
            })?;
        if entry.is_null() {
            return Err(DeviceError::LaunchFailed {
                reason: format!("mechanism_step slot of device class at {class} is NULL"),
            });
        }
        self.code
            .get(&entry)
            .map(|(_, kernel)| *kernel)
            .ok_or(DeviceError::InvalidAddress { address: entry })
    }
}

/// A software accelerator.
#[derive(Debug)]
pub struct SimulatedDevice {
    name: String,
    available: bool,
    capacity: usize,
    alignment: u64,
    memory: RwLock<DeviceMemory>,
    symbol_reads: AtomicUsize,
}

impl SimulatedDevice {
    /// Creates a device with the built-in kernels loaded.
    #[must_use]
    pub fn new(config: &DeviceConfig) -> Self {
        Self::with_kernels(config, kernels::builtin())
    }

    /// Creates a device with the given kernels loaded.
    #[must_use]
    pub fn with_kernels(config: &DeviceConfig, kernels: impl IntoIterator<Item = KernelSymbol>) -> Self {
        let mut memory = DeviceMemory {
            next: config.heap_base,
            ..DeviceMemory::default()
        };
        for (idx, k) in kernels.into_iter().enumerate() {
            let address = DeviceAddress::from_raw(CODE_BASE + idx as u64 * CODE_STRIDE);
            memory.code.insert(address, (k.symbol, k.kernel));
            memory.symbols.insert(k.symbol.to_string(), address);
        }
        debug!(device = %config.name, kernels = memory.code.len(), "simulated device ready");

        Self {
            name: config.name.clone(),
            available: true,
            capacity: config.capacity_bytes,
            alignment: config.alignment as u64,
            memory: RwLock::new(memory),
            symbol_reads: AtomicUsize::new(0),
        }
    }

    /// A device that reports itself unavailable.
    #[must_use]
    pub fn offline(config: &DeviceConfig) -> Self {
        Self {
            available: false,
            ..Self::new(config)
        }
    }

    /// Number of [`Device::read_symbol`] calls served so far.
    #[must_use]
    pub fn symbol_reads(&self) -> usize {
        self.symbol_reads.load(Ordering::Relaxed)
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> Result<usize, DeviceError> {
        let memory = self.memory.read().map_err(|_| lock_err("allocation_count"))?;
        Ok(memory.allocations.len())
    }

    /// Bytes currently allocated.
    pub fn bytes_in_use(&self) -> Result<usize, DeviceError> {
        let memory = self.memory.read().map_err(|_| lock_err("bytes_in_use"))?;
        Ok(memory.used)
    }

    fn ensure_available(&self) -> Result<(), DeviceError> {
        if self.available {
            Ok(())
        } else {
            Err(DeviceError::Unavailable {
                name: self.name.clone(),
            })
        }
    }

    fn align(&self, len: usize) -> u64 {
        let len = len.max(1) as u64;
        len.div_ceil(self.alignment) * self.alignment
    }
}

impl Device for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn allocate(&self, len: usize) -> Result<DeviceAddress, DeviceError> {
        self.ensure_available()?;
        let mut memory = self.memory.write().map_err(|_| lock_err("allocate"))?;
        let available = self.capacity.saturating_sub(memory.used);
        if len > available {
            return Err(DeviceError::AllocationFailed {
                requested: len,
                available,
            });
        }

        let base = memory.next;
        memory.next += self.align(len);
        memory.used += len;
        memory.allocations.insert(base, vec![0u8; len]);
        trace!(address = %DeviceAddress::from_raw(base), len, "device allocation");
        Ok(DeviceAddress::from_raw(base))
    }

    fn free(&self, address: DeviceAddress) -> Result<(), DeviceError> {
        let mut memory = self.memory.write().map_err(|_| lock_err("free"))?;
        let bytes = memory
            .allocations
            .remove(&address.raw())
            .ok_or(DeviceError::InvalidAddress { address })?;
        memory.used -= bytes.len();
        trace!(%address, len = bytes.len(), "device free");
        Ok(())
    }

    fn copy_to_device(&self, address: DeviceAddress, bytes: &[u8]) -> Result<(), DeviceError> {
        self.ensure_available()?;
        let mut memory = self.memory.write().map_err(|_| lock_err("copy_to_device"))?;
        let (base, offset) = memory.locate(address, bytes.len())?;
        let dst = memory
            .allocations
            .get_mut(&base)
            .ok_or(DeviceError::InvalidAddress { address })?;
        dst[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn copy_from_device(&self, address: DeviceAddress, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.ensure_available()?;
        let memory = self.memory.read().map_err(|_| lock_err("copy_from_device"))?;
        let (base, offset) = memory.locate(address, len)?;
        let src = memory
            .allocations
            .get(&base)
            .ok_or(DeviceError::InvalidAddress { address })?;
        Ok(src[offset..offset + len].to_vec())
    }

    fn read_symbol(&self, symbol: &str) -> Result<DeviceAddress, DeviceError> {
        self.ensure_available()?;
        self.symbol_reads.fetch_add(1, Ordering::Relaxed);
        let memory = self.memory.read().map_err(|_| lock_err("read_symbol"))?;
        memory
            .symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| DeviceError::SymbolNotFound {
                symbol: symbol.to_string(),
            })
    }

    fn write_symbol(&self, symbol: &str, value: DeviceAddress) -> Result<(), DeviceError> {
        self.ensure_available()?;
        let mut memory = self.memory.write().map_err(|_| lock_err("write_symbol"))?;
        memory.symbols.insert(symbol.to_string(), value);
        Ok(())
    }

    #[instrument(skip_all, fields(device = %self.name, step = launch.step, entries = launch.entries.len()))]
    fn launch(&self, launch: &StepLaunch) -> Result<Vec<f64>, DeviceError> {
        self.ensure_available()?;
        let mut memory = self.memory.write().map_err(|_| lock_err("launch"))?;

        let mut work = Vec::with_capacity(launch.entries.len());
        for entry in &launch.entries {
            let kernel = memory.resolve_step_kernel(entry.mechanism)?;
            let args = KernelArgs {
                pre_potential: entry.pre_potential,
                post_potential: entry.post_potential,
                dt: launch.dt,
                global_time: launch.global_time,
                step: launch.step,
            };
            work.push((entry.mechanism, kernel, args));
        }

        // Each thread owns exactly one object image for the duration of the launch.
        let mut images: Vec<(DeviceAddress, DeviceKernel, KernelArgs, Vec<u8>)> =
            Vec::with_capacity(work.len());
        for (address, kernel, args) in work {
            let Some(image) = memory.allocations.remove(&address.raw()) else {
                for (address, _, _, image) in images {
                    memory.allocations.insert(address.raw(), image);
                }
                return Err(DeviceError::LaunchFailed {
                    reason: format!("mechanism at {address} appears more than once in the launch"),
                });
            };
            images.push((address, kernel, args, image));
        }

        let results: Vec<Result<f64, DeviceError>> = images
            .par_iter_mut()
            .map(|(_, kernel, args, image)| (*kernel)(image.as_mut_slice(), args))
            .collect();

        for (address, _, _, image) in images {
            memory.allocations.insert(address.raw(), image);
        }
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::image::ImageWriter;
    use crate::device::LaunchEntry;

    fn config() -> DeviceConfig {
        DeviceConfig {
            capacity_bytes: 1024,
            ..DeviceConfig::default()
        }
    }

    fn echo_kernel(image: &mut [u8], args: &KernelArgs) -> Result<f64, DeviceError> {
        crate::device::image::write_f64_at(image, 8, args.pre_potential)?;
        Ok(args.post_potential)
    }

    fn echo_device() -> SimulatedDevice {
        SimulatedDevice::with_kernels(
            &config(),
            [KernelSymbol {
                symbol: "echo_dev",
                kernel: echo_kernel,
            }],
        )
    }

    fn install_object(device: &SimulatedDevice, entry: DeviceAddress) -> DeviceAddress {
        let class = ClassImage {
            super_link: DeviceAddress::NULL,
            instance_size: 16,
            slots: vec![(Selector::MechanismStep, entry)],
        }
        .encode();
        let class_addr = device.allocate(class.len()).unwrap();
        device.copy_to_device(class_addr, &class).unwrap();

        let mut w = ImageWriter::new();
        w.put_address(class_addr);
        w.put_f64(0.0);
        let object = w.into_bytes();
        let object_addr = device.allocate(object.len()).unwrap();
        device.copy_to_device(object_addr, &object).unwrap();
        object_addr
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let device = SimulatedDevice::new(&config());
        let a = device.allocate(10).unwrap();
        let b = device.allocate(10).unwrap();
        assert_eq!(a.raw() % 16, 0);
        assert_eq!(b.raw() - a.raw(), 16);
        assert_eq!(device.bytes_in_use().unwrap(), 20);
    }

    #[test]
    fn allocation_beyond_capacity_fails() {
        let device = SimulatedDevice::new(&config());
        device.allocate(1000).unwrap();
        let err = device.allocate(100).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::AllocationFailed {
                requested: 100,
                available: 24
            }
        ));
    }

    #[test]
    fn free_returns_capacity() {
        let device = SimulatedDevice::new(&config());
        let a = device.allocate(1000).unwrap();
        device.free(a).unwrap();
        assert_eq!(device.bytes_in_use().unwrap(), 0);
        assert!(device.allocate(1000).is_ok());
        assert!(matches!(device.free(a), Err(DeviceError::InvalidAddress { .. })));
    }

    #[test]
    fn transfers_are_bounds_checked() {
        let device = SimulatedDevice::new(&config());
        let a = device.allocate(8).unwrap();
        device.copy_to_device(a, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.copy_from_device(a, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(
            device.copy_to_device(a, &[0; 9]),
            Err(DeviceError::TransferFailed { .. })
        ));
        assert!(matches!(
            device.copy_from_device(DeviceAddress::from_raw(8), 1),
            Err(DeviceError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn symbols_hold_kernel_addresses() {
        let device = echo_device();
        let addr = device.read_symbol("echo_dev").unwrap();
        assert_eq!(addr.raw(), CODE_BASE);
        assert_eq!(device.symbol_reads(), 1);
        assert!(matches!(
            device.read_symbol("missing"),
            Err(DeviceError::SymbolNotFound { .. })
        ));

        device.write_symbol("Thing_dev_t", DeviceAddress::from_raw(0x40)).unwrap();
        assert_eq!(device.read_symbol("Thing_dev_t").unwrap().raw(), 0x40);
    }

    #[test]
    fn offline_device_refuses_work() {
        let device = SimulatedDevice::offline(&config());
        assert!(!device.is_available());
        assert!(matches!(device.allocate(8), Err(DeviceError::Unavailable { .. })));
    }

    #[test]
    fn launch_dispatches_through_device_class() {
        let device = echo_device();
        let entry = device.read_symbol("echo_dev").unwrap();
        let obj = install_object(&device, entry);

        let currents = device
            .launch(&StepLaunch {
                dt: 0.1,
                global_time: 0.1,
                step: 1,
                entries: vec![LaunchEntry {
                    mechanism: obj,
                    pre_potential: -55.0,
                    post_potential: 3.0,
                }],
            })
            .unwrap();
        assert_eq!(currents, vec![3.0]);

        let bytes = device.copy_from_device(obj, 16).unwrap();
        assert_eq!(crate::device::image::read_f64_at(&bytes, 8).unwrap(), -55.0);
    }

    #[test]
    fn launch_with_null_slot_fails() {
        let device = echo_device();
        let obj = install_object(&device, DeviceAddress::NULL);
        let err = device
            .launch(&StepLaunch {
                dt: 0.1,
                global_time: 0.0,
                step: 1,
                entries: vec![LaunchEntry {
                    mechanism: obj,
                    pre_potential: 0.0,
                    post_potential: 0.0,
                }],
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::LaunchFailed { .. }));
    }

    #[test]
    fn launch_rejects_duplicate_targets_and_keeps_memory() {
        let device = echo_device();
        let entry = device.read_symbol("echo_dev").unwrap();
        let obj = install_object(&device, entry);
        let twice = LaunchEntry {
            mechanism: obj,
            pre_potential: 0.0,
            post_potential: 0.0,
        };
        let err = device
            .launch(&StepLaunch {
                dt: 0.1,
                global_time: 0.0,
                step: 1,
                entries: vec![twice, twice],
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::LaunchFailed { .. }));
        assert_eq!(device.allocation_count().unwrap(), 2);
    }
}
