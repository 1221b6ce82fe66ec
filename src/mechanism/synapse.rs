//! Conductance-based synapse.
//!
//! The gating variable `g` relaxes toward the sigmoid of the presynaptic
//! potential:
//!
//! ```text
//! fv       = 1 / (1 + exp((pre_v - theta) / -sigma))
//! g[k]     = g[k-1] + dt * (tau_alpha * fv * (1 - g[k-1]) - tau_beta * g[k-1])
//! current  = -g_max * g[k-1] * (post_v - e_rev)
//! ```
//!
//! `g` is not clamped. With non-negative rates and `dt * (tau_alpha * fv +
//! tau_beta) <= 1` the update is a convex combination of `g[k-1]` and its fixed
//! point, which keeps it in `[0, 1]`.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::class::{ClassSpec, Method, Selector};
use crate::compartment::{Compartment, CompartmentId};
use crate::device::image::{read_f64_at, trace_offset, write_f64_at, ImageReader, ImageWriter};
use crate::device::kernels::{self, KernelArgs, MECHANISM_FIELDS_OFFSET};
use crate::error::{DeviceError, MyriadResult};
use crate::mechanism::{check_step, downcast_mut, Mechanism, MechanismBase, MECHANISM_CLASS_NAME};
use crate::object::{Construct, MyriadObject, MyriadType, ObjectHeader};

/// Name of the synapse class.
pub const CLASS_NAME: &str = "ConductanceSynapse";

/// Device symbol publishing the address of the synapse step's device code.
pub const STEP_DEVICE_SYMBOL: &str = "conductance_synapse_step_fxn_dev";

const PARAM_COUNT: usize = 6;

/// Kinetic parameters of a [`ConductanceSynapse`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynapseParams {
    /// Maximal conductance.
    pub g_max: f64,
    /// Reversal potential.
    pub e_rev: f64,
    /// Half-activation potential of the presynaptic sigmoid.
    pub theta: f64,
    /// Slope of the presynaptic sigmoid.
    pub sigma: f64,
    /// Opening rate.
    pub tau_alpha: f64,
    /// Closing rate.
    pub tau_beta: f64,
}

impl SynapseParams {
    /// Presynaptic activation for potential `pre_v`.
    #[must_use]
    pub fn activation(&self, pre_v: f64) -> f64 {
        1.0 / (1.0 + ((pre_v - self.theta) / -self.sigma).exp())
    }

    /// Gating value after one step from `g_prev`.
    #[must_use]
    pub fn gating_update(&self, g_prev: f64, pre_v: f64, dt: f64) -> f64 {
        let fv = self.activation(pre_v);
        g_prev + dt * (self.tau_alpha * fv * (1.0 - g_prev) - self.tau_beta * g_prev)
    }

    /// Current through the synapse with gating `g_prev`.
    #[must_use]
    pub fn current(&self, g_prev: f64, post_v: f64) -> f64 {
        -self.g_max * g_prev * (post_v - self.e_rev)
    }

    /// Fixed point of the gating update for a constant `pre_v`.
    #[must_use]
    pub fn steady_state(&self, pre_v: f64) -> f64 {
        let a = self.tau_alpha * self.activation(pre_v);
        let denom = a + self.tau_beta;
        if denom == 0.0 {
            0.0
        } else {
            a / denom
        }
    }

    fn encode(&self, image: &mut ImageWriter) {
        for v in [
            self.g_max,
            self.e_rev,
            self.theta,
            self.sigma,
            self.tau_alpha,
            self.tau_beta,
        ] {
            image.put_f64(v);
        }
    }

    fn decode_at(image: &[u8], offset: usize) -> Result<Self, DeviceError> {
        let at = |i: usize| read_f64_at(image, offset + i * 8);
        Ok(Self {
            g_max: at(0)?,
            e_rev: at(1)?,
            theta: at(2)?,
            sigma: at(3)?,
            tau_alpha: at(4)?,
            tau_beta: at(5)?,
        })
    }
}

/// Construction arguments for [`ConductanceSynapse`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynapseArgs {
    /// Presynaptic compartment.
    pub source: CompartmentId,
    /// Kinetic parameters.
    pub params: SynapseParams,
    /// Length of the gating trace.
    pub simulation_length: usize,
    /// Gating value at step 0.
    pub initial_g: f64,
}

/// A synapse whose current follows a first-order gating variable.
#[derive(Debug)]
pub struct ConductanceSynapse {
    base: MechanismBase,
    params: SynapseParams,
    g: Vec<f64>,
}

impl ConductanceSynapse {
    /// Kinetic parameters.
    #[must_use]
    pub const fn params(&self) -> &SynapseParams {
        &self.params
    }

    /// Gating trace, one value per step.
    #[must_use]
    pub fn gating(&self) -> &[f64] {
        &self.g
    }

    /// Computes step `step` from `pre_v` and `post_v` (both at `step - 1`).
    pub fn advance(&mut self, pre_v: f64, post_v: f64, dt: f64, step: usize) -> MyriadResult<f64> {
        check_step(step, self.g.len())?;
        let g_prev = self.g[step - 1];
        self.g[step] = self.params.gating_update(g_prev, pre_v, dt);
        Ok(self.params.current(g_prev, post_v))
    }
}

impl MyriadObject for ConductanceSynapse {
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
        self.params.encode(image);
        image.put_trace(&self.g);
    }

    fn decode_payload(&mut self, image: &mut ImageReader<'_>) -> Result<(), DeviceError> {
        MechanismBase::skip_fields(image)?;
        image.skip(PARAM_COUNT * 8)?;
        let at = image.position();
        let g = image.get_trace()?;
        if g.len() != self.g.len() {
            return Err(DeviceError::MalformedImage {
                offset: at,
                reason: format!("gating trace has {} values, expected {}", g.len(), self.g.len()),
            });
        }
        self.g = g;
        Ok(())
    }
}

impl Mechanism for ConductanceSynapse {
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

impl MyriadType for ConductanceSynapse {
    const CLASS_NAME: &'static str = CLASS_NAME;

    fn class_spec() -> ClassSpec {
        ClassSpec::new(CLASS_NAME, MECHANISM_CLASS_NAME)
            .instance_size(std::mem::size_of::<Self>())
            .with_override(
                Selector::MechanismStep,
                Method::mechanism_step("conductance_synapse_step", Some(STEP_DEVICE_SYMBOL), step),
            )
    }
}

impl Construct for ConductanceSynapse {
    type Args = SynapseArgs;

    fn construct(header: ObjectHeader, args: SynapseArgs) -> Self {
        let base = MechanismBase::construct(header, args.source);
        let mut g = vec![0.0; args.simulation_length];
        if let Some(first) = g.first_mut() {
            *first = args.initial_g;
        }
        Self {
            base,
            params: args.params,
            g,
        }
    }
}

fn step(
    this: &mut dyn Mechanism,
    pre: &Compartment,
    post: &Compartment,
    dt: f64,
    _global_time: f64,
    step: usize,
) -> MyriadResult<f64> {
    let synapse = downcast_mut::<ConductanceSynapse>(this)?;
    check_step(step, synapse.g.len())?;
    let pre_v = pre.potential_at(step - 1)?;
    let post_v = post.potential_at(step - 1)?;
    synapse.advance(pre_v, post_v, dt, step)
}

/// Device counterpart of the synapse step.
pub(crate) fn device_step(image: &mut [u8], args: &KernelArgs) -> Result<f64, DeviceError> {
    let params = SynapseParams::decode_at(image, MECHANISM_FIELDS_OFFSET)?;
    let mut reader = ImageReader::new(image);
    reader.skip(MECHANISM_FIELDS_OFFSET + PARAM_COUNT * 8)?;
    let (len, start) = reader.trace_header()?;
    kernels::check_step(args.step, len)?;

    let g_prev = read_f64_at(image, trace_offset(start, args.step - 1))?;
    let g_next = params.gating_update(g_prev, args.pre_potential, args.dt);
    write_f64_at(image, trace_offset(start, args.step), g_next)?;
    Ok(params.current(g_prev, args.post_potential))
}
