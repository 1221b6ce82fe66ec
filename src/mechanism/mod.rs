//! Mechanisms: per-step current sources attached to a compartment.
//!
//! The `Mechanism` class introduces the mechanism step. Its own implementation
//! contributes nothing; concrete mechanisms override it. A mechanism reads its
//! source compartment (pre) and its owning compartment (post) at `step - 1`
//! only, so mechanisms of one step never observe each other's writes.

use std::any::Any;

use tracing::trace;

use crate::class::{ClassSpec, Method, Selector};
use crate::compartment::{Compartment, CompartmentId};
use crate::device::image::{ImageReader, ImageWriter};
use crate::error::{ContractViolation, DeviceError, MyriadResult};
use crate::object::{Construct, MyriadObject, MyriadType, ObjectHeader, ROOT_CLASS_NAME};

pub mod leak;
pub mod synapse;

pub use leak::{LeakArgs, LeakChannel};
pub use synapse::{ConductanceSynapse, SynapseArgs, SynapseParams};

/// Name of the mechanism base class.
pub const MECHANISM_CLASS_NAME: &str = "Mechanism";

/// Device symbol publishing the address of the default step's device code.
pub const DEFAULT_STEP_DEVICE_SYMBOL: &str = "mechanism_step_fxn_dev";

/// Behaviour shared by every mechanism layout.
pub trait Mechanism: MyriadObject {
    /// The mechanism fields every layout embeds first.
    fn base(&self) -> &MechanismBase;

    /// Mutable mechanism fields.
    fn base_mut(&mut self) -> &mut MechanismBase;

    /// This object as a plain mechanism.
    fn as_mechanism_mut(&mut self) -> &mut dyn Mechanism;
}

/// Fields of the `Mechanism` class, and the layout of plain mechanisms.
#[derive(Debug)]
pub struct MechanismBase {
    header: ObjectHeader,
    source_id: CompartmentId,
}

impl MechanismBase {
    /// Bytes of a mechanism image before subclass fields: class tag, source id.
    pub const IMAGE_LEN: usize = ObjectHeader::IMAGE_LEN + 8;

    /// Compartment this mechanism reads as its pre entity.
    #[must_use]
    pub const fn source_id(&self) -> CompartmentId {
        self.source_id
    }

    /// Writes the mechanism fields of an image.
    pub fn encode_fields(&self, image: &mut ImageWriter) {
        image.put_u64(u64::from(self.source_id.get()));
    }

    /// Skips the mechanism fields of an image.
    pub fn skip_fields(image: &mut ImageReader<'_>) -> Result<(), DeviceError> {
        image.skip(Self::IMAGE_LEN - ObjectHeader::IMAGE_LEN)
    }
}

impl MyriadObject for MechanismBase {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        &mut self.header
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_object_mut(&mut self) -> &mut dyn MyriadObject {
        self
    }

    fn encode_payload(&self, image: &mut ImageWriter) {
        self.encode_fields(image);
    }
}

impl Mechanism for MechanismBase {
    fn base(&self) -> &MechanismBase {
        self
    }

    fn base_mut(&mut self) -> &mut MechanismBase {
        self
    }

    fn as_mechanism_mut(&mut self) -> &mut dyn Mechanism {
        self
    }
}

impl MyriadType for MechanismBase {
    const CLASS_NAME: &'static str = MECHANISM_CLASS_NAME;

    fn class_spec() -> ClassSpec {
        ClassSpec::new(MECHANISM_CLASS_NAME, ROOT_CLASS_NAME)
            .instance_size(std::mem::size_of::<Self>())
            .introduces(
                Selector::MechanismStep,
                Some(Method::mechanism_step(
                    "mechanism_step",
                    Some(DEFAULT_STEP_DEVICE_SYMBOL),
                    default_step,
                )),
            )
    }
}

impl Construct for MechanismBase {
    type Args = CompartmentId;

    fn construct(header: ObjectHeader, source_id: CompartmentId) -> Self {
        Self { header, source_id }
    }
}

fn default_step(
    this: &mut dyn Mechanism,
    _pre: &Compartment,
    _post: &Compartment,
    _dt: f64,
    global_time: f64,
    step: usize,
) -> MyriadResult<f64> {
    trace!(mechanism = %this.header().id(), step, global_time, "identity mechanism step");
    Ok(0.0)
}

/// Downcasts `this` to the layout `T`, reporting the class on failure.
pub(crate) fn downcast_mut<T: MyriadType + 'static>(
    this: &mut dyn Mechanism,
) -> MyriadResult<&mut T> {
    let class = this.header().class().name().to_string();
    this.as_any_mut().downcast_mut::<T>().ok_or_else(|| {
        ContractViolation::TypeMismatch {
            class,
            expected: T::CLASS_NAME.to_string(),
        }
        .into()
    })
}

/// Checks that `step` can be computed on a trace of `len` values.
pub(crate) fn check_step(step: usize, len: usize) -> MyriadResult<()> {
    if step == 0 || step >= len {
        return Err(ContractViolation::StepOutOfRange { step, len }.into());
    }
    Ok(())
}
