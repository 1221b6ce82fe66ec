//! Class records, selectors, and dispatch slots.
//!
//! A [`Class`] is the singleton descriptor of a type: its instance size, its
//! single superclass, and one dispatch slot per virtual operation it introduces
//! or inherits. Slots live on the class, never on instances, so swapping the
//! implementation stored in a subclass slot changes dispatch for every instance
//! of that subclass and nothing else.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compartment::Compartment;
use crate::device::DeviceAddress;
use crate::error::{ContractViolation, MyriadResult};
use crate::mechanism::Mechanism;
use crate::object::MyriadObject;

const CLASS_NAMESPACE: Uuid = Uuid::from_u128(0x6d79_7269_6164_2d63_6c61_7373_2d69_6473);

/// Stable class identifier, derived from the class name.
///
/// The same name always yields the same id, so code that knows a class by name
/// (an override looking for its own defining class) can find it without a
/// registry lookup.
///
/// # Examples
///
/// ```
/// use myriad::ClassId;
///
/// assert_eq!(ClassId::of("Mechanism"), ClassId::of("Mechanism"));
/// assert_ne!(ClassId::of("Mechanism"), ClassId::of("Compartment"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(Uuid);

impl ClassId {
    /// Returns the id of the class with the given name.
    #[must_use]
    pub fn of(name: &str) -> Self {
        Self(Uuid::new_v5(&CLASS_NAMESPACE, name.as_bytes()))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names a virtual operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Destruction chain, introduced by the root class.
    Destroy,
    /// Per-step mechanism contribution, introduced by `Mechanism`.
    MechanismStep,
    /// Per-step integration of a compartment's trace, introduced by `Compartment`.
    CompartmentStep,
}

impl Selector {
    /// Returns the selector's name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Destroy => "destroy",
            Self::MechanismStep => "mechanism_step",
            Self::CompartmentStep => "compartment_step",
        }
    }

    /// Numeric code written into device class images.
    #[must_use]
    pub const fn code(self) -> u64 {
        match self {
            Self::Destroy => 1,
            Self::MechanismStep => 2,
            Self::CompartmentStep => 3,
        }
    }

    /// Inverse of [`Selector::code`].
    #[must_use]
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Destroy),
            2 => Some(Self::MechanismStep),
            3 => Some(Self::CompartmentStep),
            _ => None,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destructor implementation. Overrides chain upward with
/// [`invoke_super_destroy`](crate::dispatch::invoke_super_destroy).
pub type DestroyFn = fn(&mut dyn MyriadObject) -> MyriadResult<()>;

/// Mechanism step implementation: `(self, pre, post, dt, global_time, step) -> current`.
pub type MechanismStepFn =
    fn(&mut dyn Mechanism, &Compartment, &Compartment, f64, f64, usize) -> MyriadResult<f64>;

/// Compartment integration implementation: `(self, current, dt, step)`.
pub type CompartmentStepFn = fn(&mut Compartment, f64, f64, usize) -> MyriadResult<()>;

/// Host entry point stored in a slot, tagged by signature.
#[derive(Clone, Copy)]
pub enum Entry {
    /// Destructor.
    Destroy(DestroyFn),
    /// Mechanism step.
    MechanismStep(MechanismStepFn),
    /// Compartment integration.
    CompartmentStep(CompartmentStepFn),
}

impl Entry {
    /// The selector whose signature this entry has.
    #[must_use]
    pub const fn selector(&self) -> Selector {
        match self {
            Self::Destroy(_) => Selector::Destroy,
            Self::MechanismStep(_) => Selector::MechanismStep,
            Self::CompartmentStep(_) => Selector::CompartmentStep,
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entry::{}", self.selector())
    }
}

/// An implementation of a virtual operation.
///
/// `device_symbol` names the device symbol holding the address of the
/// device-side counterpart, if there is one. Mirroring reads that symbol once
/// and writes the address it holds into the device copy of the slot.
#[derive(Debug, Clone, Copy)]
pub struct Method {
    symbol: &'static str,
    device_symbol: Option<&'static str>,
    entry: Entry,
}

impl Method {
    /// A destructor. Destructors have no device counterpart.
    #[must_use]
    pub const fn destroy(symbol: &'static str, f: DestroyFn) -> Self {
        Self {
            symbol,
            device_symbol: None,
            entry: Entry::Destroy(f),
        }
    }

    /// A mechanism step, optionally paired with a device-side counterpart.
    #[must_use]
    pub const fn mechanism_step(
        symbol: &'static str,
        device_symbol: Option<&'static str>,
        f: MechanismStepFn,
    ) -> Self {
        Self {
            symbol,
            device_symbol,
            entry: Entry::MechanismStep(f),
        }
    }

    /// A compartment integration step. Integration runs on the host only.
    #[must_use]
    pub const fn compartment_step(symbol: &'static str, f: CompartmentStepFn) -> Self {
        Self {
            symbol,
            device_symbol: None,
            entry: Entry::CompartmentStep(f),
        }
    }

    /// Host symbol name.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        self.symbol
    }

    /// Device symbol holding the address of the device counterpart.
    #[must_use]
    pub const fn device_symbol(&self) -> Option<&'static str> {
        self.device_symbol
    }

    /// Selector matching this method's signature.
    #[must_use]
    pub const fn selector(&self) -> Selector {
        self.entry.selector()
    }

    /// The host entry point.
    #[must_use]
    pub const fn entry(&self) -> Entry {
        self.entry
    }
}

/// One dispatch slot of a class.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    /// Operation this slot dispatches.
    pub selector: Selector,
    /// Current implementation; `None` means unset.
    pub method: Option<Method>,
}

/// Description of a class to be created by the registry.
///
/// # Example
/// ```rust,ignore
/// let spec = ClassSpec::new("ScaledSynapse", "ConductanceSynapse")
///     .instance_size(std::mem::size_of::<ConductanceSynapse>())
///     .with_override(Selector::MechanismStep, Method::mechanism_step("scaled_step", None, scaled_step));
/// ```
#[derive(Debug, Clone)]
pub struct ClassSpec {
    name: String,
    superclass: Option<String>,
    instance_size: Option<usize>,
    introduces: Vec<(Selector, Option<Method>)>,
    overrides: Vec<(Selector, Method)>,
}

impl ClassSpec {
    /// The root class spec. Only the registry creates a root.
    pub(crate) fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            instance_size: None,
            introduces: Vec::new(),
            overrides: Vec::new(),
        }
    }

    /// A class extending `superclass`.
    pub fn new(name: impl Into<String>, superclass: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: Some(superclass.into()),
            instance_size: None,
            introduces: Vec::new(),
            overrides: Vec::new(),
        }
    }

    /// Set the instance size in bytes (default: the superclass's size).
    #[must_use]
    pub fn instance_size(mut self, bytes: usize) -> Self {
        self.instance_size = Some(bytes);
        self
    }

    /// Declare a new virtual operation with an optional default implementation.
    #[must_use]
    pub fn introduces(mut self, selector: Selector, default: Option<Method>) -> Self {
        self.introduces.push((selector, default));
        self
    }

    /// Record `method` in the slot for `selector`.
    ///
    /// Pairs are applied in order, so a later pair for the same selector wins.
    /// A selector the class neither introduces nor inherits is ignored.
    #[must_use]
    pub fn with_override(mut self, selector: Selector, method: Method) -> Self {
        self.overrides.push((selector, method));
        self
    }

    /// Class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Superclass name (`None` for the root).
    #[must_use]
    pub fn superclass(&self) -> Option<&str> {
        self.superclass.as_deref()
    }

    /// Id of the class this spec describes.
    #[must_use]
    pub fn id(&self) -> ClassId {
        ClassId::of(&self.name)
    }
}

/// Singleton descriptor of a type.
pub struct Class {
    id: ClassId,
    name: String,
    instance_size: usize,
    superclass: Option<Arc<Class>>,
    depth: usize,
    slots: Vec<Slot>,
    device_mirror: OnceLock<DeviceAddress>,
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("instance_size", &self.instance_size)
            .field(
                "superclass",
                &self.superclass.as_ref().map_or(self.name.as_str(), |s| s.name()),
            )
            .field("depth", &self.depth)
            .field("slots", &self.slots)
            .field("device_mirror", &self.device_mirror.get())
            .finish_non_exhaustive()
    }
}

fn check_signature(selector: Selector, method: &Method) -> Result<(), ContractViolation> {
    if method.selector() == selector {
        Ok(())
    } else {
        Err(ContractViolation::SignatureMismatch {
            symbol: method.symbol().to_string(),
            selector,
        })
    }
}

impl Class {
    /// Builds a class from its spec. Slots start as a copy of the superclass's
    /// slots, then introduced selectors are appended, then overrides applied.
    pub(crate) fn from_spec(spec: ClassSpec, superclass: Option<Arc<Class>>) -> MyriadResult<Self> {
        let ClassSpec {
            name,
            instance_size,
            introduces,
            overrides,
            ..
        } = spec;

        let (mut slots, depth, min_size) = match &superclass {
            Some(parent) => (parent.slots.clone(), parent.depth + 1, parent.instance_size),
            None => (Vec::new(), 0, 0),
        };

        let instance_size = instance_size.unwrap_or(min_size);
        if instance_size < min_size {
            return Err(ContractViolation::LayoutMismatch {
                class: name,
                declared: instance_size,
                actual: min_size,
            }
            .into());
        }

        for (selector, default) in introduces {
            if let Some(method) = &default {
                check_signature(selector, method)?;
            }
            if let Some(slot) = slots.iter_mut().find(|s| s.selector == selector) {
                warn!(class = %name, %selector, "selector already inherited; treating as override");
                if default.is_some() {
                    slot.method = default;
                }
                continue;
            }
            slots.push(Slot {
                selector,
                method: default,
            });
        }

        for (selector, method) in overrides {
            check_signature(selector, &method)?;
            match slots.iter_mut().find(|s| s.selector == selector) {
                Some(slot) => slot.method = Some(method),
                None => {
                    warn!(class = %name, %selector, symbol = method.symbol(), "override for undeclared selector ignored");
                }
            }
        }

        debug!(class = %name, depth, instance_size, slots = slots.len(), "class created");

        Ok(Self {
            id: ClassId::of(&name),
            name,
            instance_size,
            superclass,
            depth,
            slots,
            device_mirror: OnceLock::new(),
        })
    }

    /// Class id.
    #[must_use]
    pub const fn id(&self) -> ClassId {
        self.id
    }

    /// Class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance size in bytes.
    #[must_use]
    pub const fn instance_size(&self) -> usize {
        self.instance_size
    }

    /// Number of superclass links between this class and the root.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// True for the root class.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.superclass.is_none()
    }

    /// The superclass. The root is its own superclass.
    #[must_use]
    pub fn superclass(self: &Arc<Self>) -> Arc<Class> {
        self.superclass.clone().unwrap_or_else(|| Arc::clone(self))
    }

    /// The immediate superclass as a plain reference; the root returns itself.
    #[must_use]
    pub fn super_ref(&self) -> &Class {
        self.superclass.as_deref().unwrap_or(self)
    }

    /// True if this class introduces or inherits `selector`.
    #[must_use]
    pub fn declares(&self, selector: Selector) -> bool {
        self.slots.iter().any(|s| s.selector == selector)
    }

    /// Current implementation for `selector`, if declared and set.
    #[must_use]
    pub fn slot(&self, selector: Selector) -> Option<Method> {
        self.slots
            .iter()
            .find(|s| s.selector == selector)
            .and_then(|s| s.method)
    }

    /// All slots, inherited ones first in root-to-leaf order.
    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// True if the record `ancestor` appears in this class's superclass chain
    /// (itself included). Records are compared by address, so an equally
    /// named class from another registry never matches.
    #[must_use]
    pub fn is_subclass_of(&self, ancestor: &Class) -> bool {
        let mut current = self;
        loop {
            if std::ptr::eq(current, ancestor) {
                return true;
            }
            match &current.superclass {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Finds `id` in this class's chain.
    #[must_use]
    pub fn ancestor(self: &Arc<Self>, id: ClassId) -> Option<Arc<Class>> {
        let mut current = Arc::clone(self);
        loop {
            if current.id == id {
                return Some(current);
            }
            let next = current.superclass.clone()?;
            current = next;
        }
    }

    /// This class followed by each superclass up to the root.
    #[must_use]
    pub fn lineage(self: &Arc<Self>) -> Vec<Arc<Class>> {
        let mut out = Vec::with_capacity(self.depth + 1);
        let mut current = Some(Arc::clone(self));
        while let Some(class) = current {
            current = class.superclass.clone();
            out.push(class);
        }
        out
    }

    /// Device mirror address, once this class has been mirrored.
    #[must_use]
    pub fn device_mirror(&self) -> Option<DeviceAddress> {
        self.device_mirror.get().copied()
    }

    /// Records the device mirror. Returns the established address if another
    /// mirror won the race.
    pub(crate) fn set_device_mirror(&self, address: DeviceAddress) -> Result<(), DeviceAddress> {
        self.device_mirror.set(address).map_err(|_| {
            self.device_mirror
                .get()
                .copied()
                .unwrap_or(address)
        })
    }
}
