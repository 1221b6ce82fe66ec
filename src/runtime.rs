//! The runtime: class registry, construction, and the device connection.
//!
//! A [`Runtime`] owns the class registry (seeded with the root class) and,
//! when built with a device, the mirroring engine and the launch stream.
//! Device availability is checked once, when the runtime is built; every
//! later device operation assumes it.

use std::sync::Arc;

use tracing::{debug, error, info, trace};

use crate::class::{Class, ClassSpec};
use crate::config::RuntimeConfig;
use crate::device::{Device, DeviceStream, SimulatedDevice, StepLaunch};
use crate::error::{ContractViolation, DeviceError, MyriadError, MyriadResult};
use crate::mirror::{MirrorEngine, MirrorReport, ObjectMirror};
use crate::object::{Construct, MyriadObject, MyriadType, ObjectHeader};
use crate::registry::ClassRegistry;

struct DeviceLink {
    mirror: MirrorEngine,
    stream: DeviceStream,
}

/// Object runtime.
pub struct Runtime {
    config: RuntimeConfig,
    registry: ClassRegistry,
    device: Option<DeviceLink>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field(
                "device",
                &self.device.as_ref().map(|link| link.mirror.device().name()),
            )
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates a host-only runtime.
    pub fn new(config: RuntimeConfig) -> MyriadResult<Self> {
        config.validate()?;
        let registry = ClassRegistry::new()?;
        debug!("host runtime created");
        Ok(Self {
            config,
            registry,
            device: None,
        })
    }

    /// Creates a runtime connected to `device`.
    pub fn with_device(config: RuntimeConfig, device: Arc<dyn Device>) -> MyriadResult<Self> {
        config.validate()?;
        let registry = ClassRegistry::new()?;
        let mirror = MirrorEngine::new(Arc::clone(&device))?;
        let stream = DeviceStream::start(device, config.device.stream_queue_capacity)?;
        info!(device = mirror.device().name(), "device runtime created");
        Ok(Self {
            config,
            registry,
            device: Some(DeviceLink { mirror, stream }),
        })
    }

    /// Creates a runtime connected to a [`SimulatedDevice`] built from the config.
    pub fn with_simulated_device(config: RuntimeConfig) -> MyriadResult<Self> {
        config.validate()?;
        let device = Arc::new(SimulatedDevice::new(&config.device));
        Self::with_device(config, device)
    }

    /// Configuration the runtime was built with.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The class registry.
    #[must_use]
    pub const fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    /// The root class.
    #[must_use]
    pub fn root_class(&self) -> &Arc<Class> {
        self.registry.root()
    }

    /// True if the runtime has a device.
    #[must_use]
    pub const fn has_device(&self) -> bool {
        self.device.is_some()
    }

    fn link(&self) -> MyriadResult<&DeviceLink> {
        self.device.as_ref().ok_or_else(|| {
            error!("device operation on a host-only runtime");
            DeviceError::Unavailable {
                name: "none".to_string(),
            }
            .into()
        })
    }

    /// Initializes the class for layout `T`.
    ///
    /// The first call creates the class, and mirrors it when `use_device` is
    /// set. Later calls return the existing class.
    pub fn init_type<T: MyriadType>(&self, use_device: bool) -> MyriadResult<Arc<Class>> {
        self.init_class(T::class_spec(), use_device)
    }

    /// Initializes the class described by `spec`. See [`Runtime::init_type`].
    pub fn init_class(&self, spec: ClassSpec, use_device: bool) -> MyriadResult<Arc<Class>> {
        let (class, created) = self.registry.register(spec)?;
        if created {
            info!(class = class.name(), depth = class.depth(), "class initialized");
        }
        if use_device && class.device_mirror().is_none() {
            self.mirror_class(&class)?;
        }
        Ok(class)
    }

    /// The initialized class named `name`.
    pub fn class(&self, name: &str) -> MyriadResult<Arc<Class>> {
        self.registry.require(name)
    }

    /// The initialized class of layout `T`.
    pub fn class_for<T: MyriadType>(&self) -> MyriadResult<Arc<Class>> {
        self.registry.require(T::CLASS_NAME)
    }

    /// Builds an object of `class` with layout `T`.
    ///
    /// `class` must belong to this runtime, be a kind of `T`'s class, and
    /// declare exactly `T`'s size.
    pub fn construct<T: Construct>(&self, class: &Arc<Class>, args: T::Args) -> MyriadResult<T> {
        if !self.registry.contains(class)? {
            return Err(ContractViolation::ClassNotInitialized {
                name: class.name().to_string(),
            }
            .into());
        }
        let layout_class = self.class_for::<T>()?;
        if !class.is_subclass_of(&layout_class) {
            return Err(ContractViolation::TypeMismatch {
                class: class.name().to_string(),
                expected: T::CLASS_NAME.to_string(),
            }
            .into());
        }
        let actual = std::mem::size_of::<T>();
        if class.instance_size() != actual {
            return Err(ContractViolation::LayoutMismatch {
                class: class.name().to_string(),
                declared: class.instance_size(),
                actual,
            }
            .into());
        }

        let object = T::construct(ObjectHeader::new(Arc::clone(class)), args);
        trace!(class = class.name(), object = %object.header().id(), "object constructed");
        Ok(object)
    }

    /// Builds an object of `T`'s own class, which must be initialized.
    pub fn create<T: Construct>(&self, args: T::Args) -> MyriadResult<T> {
        let class = self.class_for::<T>()?;
        self.construct(&class, args)
    }

    fn require_own(&self, class: &Arc<Class>) -> MyriadResult<()> {
        if self.registry.contains(class)? {
            return Ok(());
        }
        error!(class = class.name(), "class belongs to another runtime");
        Err(ContractViolation::ClassNotInitialized {
            name: class.name().to_string(),
        }
        .into())
    }

    /// Mirrors `class` and its ancestors to the device.
    ///
    /// `class` must belong to this runtime; a class mirror is permanent and
    /// only valid on this runtime's device.
    pub fn mirror_class(&self, class: &Arc<Class>) -> MyriadResult<MirrorReport> {
        let link = self.link()?;
        self.require_own(class)?;
        link.mirror.mirror_class(class)
    }

    /// Mirrors `object` to the device. The caller owns the returned mirror.
    pub fn mirror_object<O: MyriadObject + ?Sized>(&self, object: &O) -> MyriadResult<ObjectMirror> {
        let link = self.link()?;
        self.require_own(object.header().class())?;
        link.mirror.mirror_object(object)
    }

    /// Reads device-written state of `object` back from `mirror`.
    pub fn sync_from_device<O: MyriadObject + ?Sized>(
        &self,
        object: &mut O,
        mirror: &ObjectMirror,
    ) -> MyriadResult<()> {
        self.link()?.mirror.sync_from_device(object, mirror)
    }

    /// Frees an object mirror.
    pub fn release_mirror(&self, mirror: ObjectMirror) -> MyriadResult<()> {
        self.link()?.mirror.release(mirror)
    }

    /// Queues a launch on the device stream and waits for its currents.
    pub fn launch(&self, launch: StepLaunch) -> MyriadResult<Vec<f64>> {
        let link = self.link()?;
        let currents = link
            .stream
            .submit(launch)
            .and_then(crate::device::LaunchHandle::join)
            .map_err(MyriadError::from)?;
        Ok(currents)
    }

    /// Waits for every queued launch to finish.
    pub fn synchronize(&self) -> MyriadResult<()> {
        Ok(self.link()?.stream.synchronize()?)
    }

    /// The device stream, for callers that pipeline their own launches.
    pub fn stream(&self) -> MyriadResult<&DeviceStream> {
        Ok(&self.link()?.stream)
    }
}
