//! Passive leak channel: `current = -g_leak * (post_v - e_rev)`.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::class::{ClassSpec, Method, Selector};
use crate::compartment::{Compartment, CompartmentId};
use crate::device::image::{read_f64_at, ImageWriter};
use crate::device::kernels::{KernelArgs, MECHANISM_FIELDS_OFFSET};
use crate::error::{DeviceError, MyriadResult};
use crate::mechanism::{check_step, downcast_mut, Mechanism, MechanismBase, MECHANISM_CLASS_NAME};
use crate::object::{Construct, MyriadObject, MyriadType, ObjectHeader};

/// Name of the leak channel class.
pub const CLASS_NAME: &str = "LeakChannel";

/// Device symbol publishing the address of the leak step's device code.
pub const STEP_DEVICE_SYMBOL: &str = "leak_channel_step_fxn_dev";

/// Construction arguments for [`LeakChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakArgs {
    /// Compartment the channel reads as pre. Usually its owner.
    pub source: CompartmentId,
    /// Leak conductance.
    pub g_leak: f64,
    /// Reversal potential.
    pub e_rev: f64,
}

/// A constant-conductance leak.
#[derive(Debug)]
pub struct LeakChannel {
    base: MechanismBase,
    g_leak: f64,
    e_rev: f64,
}

impl LeakChannel {
    /// Leak conductance.
    #[must_use]
    pub const fn g_leak(&self) -> f64 {
        self.g_leak
    }

    /// Reversal potential.
    #[must_use]
    pub const fn e_rev(&self) -> f64 {
        self.e_rev
    }
}

/// Leak current at membrane potential `post_v`.
#[must_use]
pub fn leak_current(g_leak: f64, e_rev: f64, post_v: f64) -> f64 {
    -g_leak * (post_v - e_rev)
}

impl MyriadObject for LeakChannel {
    fn header(&self) -> &ObjectHeader {
        self.base.header()
    }

    fn header_mut(&mut self) -> &mut ObjectHeader {
        self.base.header_mut()
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
        self.base.encode_fields(image);
        image.put_f64(self.g_leak);
        image.put_f64(self.e_rev);
    }
}

impl Mechanism for LeakChannel {
    fn base(&self) -> &MechanismBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MechanismBase {
        &mut self.base
    }

    fn as_mechanism_mut(&mut self) -> &mut dyn Mechanism {
        self
    }
}

impl MyriadType for LeakChannel {
    const CLASS_NAME: &'static str = CLASS_NAME;

    fn class_spec() -> ClassSpec {
        ClassSpec::new(CLASS_NAME, MECHANISM_CLASS_NAME)
            .instance_size(std::mem::size_of::<Self>())
            .with_override(
                Selector::MechanismStep,
                Method::mechanism_step("leak_channel_step", Some(STEP_DEVICE_SYMBOL), step),
            )
    }
}

impl Construct for LeakChannel {
    type Args = LeakArgs;

    fn construct(header: ObjectHeader, args: LeakArgs) -> Self {
        Self {
            base: MechanismBase::construct(header, args.source),
            g_leak: args.g_leak,
            e_rev: args.e_rev,
        }
    }
}

fn step(
    this: &mut dyn Mechanism,
    _pre: &Compartment,
    post: &Compartment,
    _dt: f64,
    _global_time: f64,
    step: usize,
) -> MyriadResult<f64> {
    let leak = downcast_mut::<LeakChannel>(this)?;
    check_step(step, post.potentials().len())?;
    let post_v = post.potential_at(step - 1)?;
    Ok(leak_current(leak.g_leak, leak.e_rev, post_v))
}

/// Device counterpart of the leak step.
pub(crate) fn device_step(image: &mut [u8], args: &KernelArgs) -> Result<f64, DeviceError> {
    if args.step == 0 {
        return Err(DeviceError::LaunchFailed {
            reason: "step 0 has no predecessor".to_string(),
        });
    }
    let g_leak = read_f64_at(image, MECHANISM_FIELDS_OFFSET)?;
    let e_rev = read_f64_at(image, MECHANISM_FIELDS_OFFSET + 8)?;
    Ok(leak_current(g_leak, e_rev, args.post_potential))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_pulls_toward_reversal() {
        assert!(leak_current(0.8, -65.0, -70.0) > 0.0);
        assert!(leak_current(0.8, -65.0, -60.0) < 0.0);
        assert_eq!(leak_current(0.8, -65.0, -65.0), 0.0);
    }

    #[test]
    fn device_kernel_reads_fields_after_base() {
        let mut w = ImageWriter::new();
        w.put_u64(0x1000);
        w.put_u64(3);
        w.put_f64(0.8);
        w.put_f64(-65.0);
        let mut image = w.into_bytes();
        let args = KernelArgs {
            pre_potential: -70.0,
            post_potential: -70.0,
            dt: 0.001,
            global_time: 0.001,
            step: 1,
        };
        assert_eq!(device_step(&mut image, &args).unwrap(), leak_current(0.8, -65.0, -70.0));
    }
}
