//! Compartments: mechanism owners with a per-step potential trace.
//!
//! Stepping a compartment at `step` sums the currents of its mechanisms in
//! insertion order, then integrates the sum into `vm[step]` through the
//! compartment step slot. Mechanisms read `step - 1` only, so the order of
//! mechanisms and the order compartments are stepped in do not change the
//! result.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::class::{ClassId, ClassSpec, Method, Selector};
use crate::device::image::{ImageReader, ImageWriter};
use crate::dispatch;
use crate::error::{ContractViolation, DeviceError, MyriadError, MyriadResult};
use crate::mechanism::{check_step, Mechanism};
use crate::network::Network;
use crate::object::{self, Construct, MyriadObject, MyriadType, ObjectHeader, ROOT_CLASS_NAME};

/// Name of the compartment class.
pub const COMPARTMENT_CLASS_NAME: &str = "Compartment";

/// Identifier of a compartment within a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompartmentId(u32);

impl CompartmentId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CompartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Construction arguments for [`Compartment`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompartmentArgs {
    /// Compartment id.
    pub id: CompartmentId,
    /// Length of the potential trace.
    pub simulation_length: usize,
    /// Potential at step 0.
    pub initial_potential: f64,
    /// Membrane capacitance. Zero or non-finite values fail at the first step.
    pub capacitance: f64,
}

/// A compartment and the mechanisms it owns.
pub struct Compartment {
    header: ObjectHeader,
    id: CompartmentId,
    vm: Vec<f64>,
    capacitance: f64,
    mechanisms: Vec<Box<dyn Mechanism>>,
}

impl fmt::Debug for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compartment")
            .field("id", &self.id)
            .field("class", &self.header.class().name())
            .field("steps", &self.vm.len())
            .field("capacitance", &self.capacitance)
            .field("mechanisms", &self.mechanisms.len())
            .finish_non_exhaustive()
    }
}

impl Compartment {
    /// Compartment id.
    #[must_use]
    pub const fn id(&self) -> CompartmentId {
        self.id
    }

    /// Membrane capacitance.
    #[must_use]
    pub const fn capacitance(&self) -> f64 {
        self.capacitance
    }

    /// Potential trace, one value per step.
    #[must_use]
    pub fn potentials(&self) -> &[f64] {
        &self.vm
    }

    /// Potential at `step`.
    pub fn potential_at(&self, step: usize) -> MyriadResult<f64> {
        self.vm.get(step).copied().ok_or_else(|| {
            ContractViolation::StepOutOfRange {
                step,
                len: self.vm.len(),
            }
            .into()
        })
    }

    /// Overwrites the potential at `step`. Meant for integration overrides.
    pub fn set_potential(&mut self, step: usize, value: f64) -> MyriadResult<()> {
        let len = self.vm.len();
        let slot = self
            .vm
            .get_mut(step)
            .ok_or(ContractViolation::StepOutOfRange { step, len })?;
        *slot = value;
        Ok(())
    }

    /// Owned mechanisms in insertion order.
    #[must_use]
    pub fn mechanisms(&self) -> &[Box<dyn Mechanism>] {
        &self.mechanisms
    }

    /// Mutable access to owned mechanisms.
    pub fn mechanisms_mut(&mut self) -> &mut [Box<dyn Mechanism>] {
        &mut self.mechanisms
    }

    /// Takes ownership of `mechanism`.
    ///
    /// The same mechanism instance cannot be attached twice.
    pub fn add_mechanism(&mut self, mechanism: Box<dyn Mechanism>) -> MyriadResult<()> {
        let id = mechanism.header().id();
        if self.mechanisms.iter().any(|m| m.header().id() == id) {
            return Err(ContractViolation::DuplicateMechanism {
                id,
                compartment: self.id,
            }
            .into());
        }
        debug!(
            compartment = %self.id,
            mechanism = %id,
            class = mechanism.header().class().name(),
            "mechanism attached"
        );
        self.mechanisms.push(mechanism);
        Ok(())
    }

    /// Steps this compartment at `step`.
    ///
    /// Sources other than this compartment are looked up in `network`.
    pub fn step(
        &mut self,
        network: &Network,
        dt: f64,
        global_time: f64,
        step: usize,
    ) -> MyriadResult<()> {
        check_step(step, self.vm.len())?;
        let mut mechanisms = std::mem::take(&mut self.mechanisms);
        let current = accumulate(&mut mechanisms, self, network, dt, global_time, step);
        self.mechanisms = mechanisms;
        dispatch::invoke_compartment_step(self, current?, dt, step)
    }

    pub(crate) fn take_mechanisms(&mut self) -> Vec<Box<dyn Mechanism>> {
        std::mem::take(&mut self.mechanisms)
    }

    pub(crate) fn restore_mechanisms(&mut self, mechanisms: Vec<Box<dyn Mechanism>>) {
        self.mechanisms = mechanisms;
    }
}

/// Sums the currents of `mechanisms` owned by `post` at `step`.
pub(crate) fn accumulate(
    mechanisms: &mut [Box<dyn Mechanism>],
    post: &Compartment,
    network: &Network,
    dt: f64,
    global_time: f64,
    step: usize,
) -> MyriadResult<f64> {
    let mut current = 0.0;
    for mechanism in mechanisms.iter_mut() {
        let source = mechanism.base().source_id();
        let pre = if source == post.id {
            post
        } else {
            network
                .get(source)
                .ok_or(ContractViolation::UnknownCompartment { id: source })?
        };
        current += dispatch::invoke_mechanism_step(
            mechanism.as_mechanism_mut(),
            pre,
            post,
            dt,
            global_time,
            step,
        )?;
    }
    trace!(compartment = %post.id, step, current, "mechanism currents summed");
    Ok(current)
}

impl MyriadObject for Compartment {
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
        image.put_u64(u64::from(self.id.get()));
        image.put_f64(self.capacitance);
        image.put_u64(self.mechanisms.len() as u64);
        image.put_trace(&self.vm);
    }

    fn decode_payload(&mut self, image: &mut ImageReader<'_>) -> Result<(), DeviceError> {
        image.skip(3 * 8)?;
        let at = image.position();
        let vm = image.get_trace()?;
        if vm.len() != self.vm.len() {
            return Err(DeviceError::MalformedImage {
                offset: at,
                reason: format!("potential trace has {} values, expected {}", vm.len(), self.vm.len()),
            });
        }
        self.vm = vm;
        Ok(())
    }
}

impl MyriadType for Compartment {
    const CLASS_NAME: &'static str = COMPARTMENT_CLASS_NAME;

    fn class_spec() -> ClassSpec {
        ClassSpec::new(COMPARTMENT_CLASS_NAME, ROOT_CLASS_NAME)
            .instance_size(std::mem::size_of::<Self>())
            .introduces(
                Selector::CompartmentStep,
                Some(Method::compartment_step("compartment_euler_step", euler_step)),
            )
            .with_override(
                Selector::Destroy,
                Method::destroy("compartment_destroy", compartment_destroy),
            )
    }
}

impl Construct for Compartment {
    type Args = CompartmentArgs;

    fn construct(header: ObjectHeader, args: CompartmentArgs) -> Self {
        let mut vm = vec![0.0; args.simulation_length];
        if let Some(first) = vm.first_mut() {
            *first = args.initial_potential;
        }
        Self {
            header,
            id: args.id,
            vm,
            capacitance: args.capacitance,
            mechanisms: Vec::new(),
        }
    }
}

/// Forward Euler: `vm[step] = vm[step - 1] + dt * current / capacitance`.
fn euler_step(this: &mut Compartment, current: f64, dt: f64, step: usize) -> MyriadResult<()> {
    check_step(step, this.vm.len())?;
    if this.capacitance == 0.0 || !this.capacitance.is_finite() {
        return Err(ContractViolation::InvalidCapacitance {
            id: this.id,
            capacitance: this.capacitance,
        }
        .into());
    }
    this.vm[step] = this.vm[step - 1] + dt * (current / this.capacitance);
    Ok(())
}

fn compartment_destroy(this: &mut dyn MyriadObject) -> MyriadResult<()> {
    let class = this
        .header()
        .class()
        .ancestor(ClassId::of(COMPARTMENT_CLASS_NAME))
        .ok_or_else(|| MyriadError::internal("compartment destructor on a non-compartment class"))?;

    let Some(compartment) = this.as_any_mut().downcast_mut::<Compartment>() else {
        return Err(ContractViolation::TypeMismatch {
            class: class.name().to_string(),
            expected: COMPARTMENT_CLASS_NAME.to_string(),
        }
        .into());
    };
    for mechanism in &mut compartment.mechanisms {
        object::destroy(&mut **mechanism)?;
    }
    compartment.mechanisms.clear();

    dispatch::invoke_super_destroy(&class, this)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClassRegistry;

    fn compartment(len: usize) -> Compartment {
        let registry = ClassRegistry::new().unwrap();
        let (class, _) = registry.register(Compartment::class_spec()).unwrap();
        Compartment::construct(
            ObjectHeader::new(class),
            CompartmentArgs {
                id: CompartmentId::new(2),
                simulation_length: len,
                initial_potential: -70.0,
                capacitance: 0.5,
            },
        )
    }

    #[test]
    fn construction_seeds_only_the_first_step() {
        let c = compartment(4);
        assert_eq!(c.potentials(), &[-70.0, 0.0, 0.0, 0.0]);
        assert_eq!(c.id().to_string(), "#2");
        assert!(c.mechanisms().is_empty());
        assert!(compartment(0).potentials().is_empty());
    }

    #[test]
    fn potential_access_is_range_checked() {
        let mut c = compartment(2);
        c.set_potential(1, -55.0).unwrap();
        assert_eq!(c.potential_at(1).unwrap(), -55.0);
        assert!(c.potential_at(2).is_err());
        assert!(c.set_potential(2, 0.0).is_err());
    }

    #[test]
    fn euler_step_scales_by_capacitance() {
        let mut c = compartment(3);
        euler_step(&mut c, 2.0, 0.1, 1).unwrap();
        assert!((c.potentials()[1] - (-70.0 + 0.1 * 4.0)).abs() < 1e-12);
        assert!(euler_step(&mut c, 2.0, 0.1, 0).is_err());
    }

    #[test]
    fn zero_capacitance_is_rejected_before_writing() {
        let mut c = compartment(3);
        c.capacitance = 0.0;
        let err = euler_step(&mut c, 2.0, 0.1, 1).unwrap_err();
        assert!(matches!(
            err,
            MyriadError::Contract(ContractViolation::InvalidCapacitance { .. })
        ));
        assert_eq!(c.potentials()[1], 0.0);
    }

    #[test]
    fn payload_reads_back_the_trace() {
        let mut c = compartment(3);
        c.set_potential(2, -60.0).unwrap();
        let mut image = ImageWriter::new();
        c.encode_payload(&mut image);
        let bytes = image.into_bytes();

        let mut copy = compartment(3);
        copy.decode_payload(&mut ImageReader::new(&bytes)).unwrap();
        assert_eq!(copy.potentials(), c.potentials());

        let mut shorter = compartment(2);
        let err = shorter
            .decode_payload(&mut ImageReader::new(&bytes))
            .unwrap_err();
        assert!(matches!(err, DeviceError::MalformedImage { .. }));
    }
}
