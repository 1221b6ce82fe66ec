//! Virtual dispatch through class slots.
//!
//! `invoke_*` resolves through the object's concrete class, so the most-derived
//! implementation always wins. `invoke_super_*` takes the class that defines the
//! calling override and resolves through that class's immediate superclass,
//! which is how an override extends its parent's behaviour instead of replacing
//! it.
//!
//! An unset slot is a wiring error and surfaces as
//! [`ContractViolation::UnsetSlot`], never as a zero result.

use std::sync::Arc;

use tracing::error;

use crate::class::{Class, Entry, Method, Selector};
use crate::compartment::Compartment;
use crate::error::{ContractViolation, MyriadResult};
use crate::mechanism::Mechanism;
use crate::object::MyriadObject;

fn resolve(class: &Class, selector: Selector) -> MyriadResult<Method> {
    if let Some(method) = class.slot(selector) {
        return Ok(method);
    }
    let violation = if class.declares(selector) {
        ContractViolation::UnsetSlot {
            class: class.name().to_string(),
            selector,
        }
    } else {
        ContractViolation::UndeclaredSelector {
            class: class.name().to_string(),
            selector,
        }
    };
    error!(class = class.name(), %selector, "dispatch failed: {violation}");
    Err(violation.into())
}

fn mismatch(method: &Method, selector: Selector) -> ContractViolation {
    ContractViolation::SignatureMismatch {
        symbol: method.symbol().to_string(),
        selector,
    }
}

fn call_mechanism_step(
    class: &Class,
    this: &mut dyn Mechanism,
    pre: &Compartment,
    post: &Compartment,
    dt: f64,
    global_time: f64,
    step: usize,
) -> MyriadResult<f64> {
    let method = resolve(class, Selector::MechanismStep)?;
    match method.entry() {
        Entry::MechanismStep(f) => f(this, pre, post, dt, global_time, step),
        _ => Err(mismatch(&method, Selector::MechanismStep).into()),
    }
}

/// Runs the mechanism step of `this`'s concrete class and returns its current.
pub fn invoke_mechanism_step(
    this: &mut dyn Mechanism,
    pre: &Compartment,
    post: &Compartment,
    dt: f64,
    global_time: f64,
    step: usize,
) -> MyriadResult<f64> {
    let class = Arc::clone(this.header().class());
    call_mechanism_step(&class, this, pre, post, dt, global_time, step)
}

/// Runs the mechanism step stored on `class`'s superclass.
pub fn invoke_super_mechanism_step(
    class: &Class,
    this: &mut dyn Mechanism,
    pre: &Compartment,
    post: &Compartment,
    dt: f64,
    global_time: f64,
    step: usize,
) -> MyriadResult<f64> {
    call_mechanism_step(class.super_ref(), this, pre, post, dt, global_time, step)
}

fn call_compartment_step(
    class: &Class,
    this: &mut Compartment,
    current: f64,
    dt: f64,
    step: usize,
) -> MyriadResult<()> {
    let method = resolve(class, Selector::CompartmentStep)?;
    match method.entry() {
        Entry::CompartmentStep(f) => f(this, current, dt, step),
        _ => Err(mismatch(&method, Selector::CompartmentStep).into()),
    }
}

/// Integrates `current` into `this`'s trace at `step`.
pub fn invoke_compartment_step(
    this: &mut Compartment,
    current: f64,
    dt: f64,
    step: usize,
) -> MyriadResult<()> {
    let class = Arc::clone(this.header().class());
    call_compartment_step(&class, this, current, dt, step)
}

/// Runs the integration step stored on `class`'s superclass.
pub fn invoke_super_compartment_step(
    class: &Class,
    this: &mut Compartment,
    current: f64,
    dt: f64,
    step: usize,
) -> MyriadResult<()> {
    call_compartment_step(class.super_ref(), this, current, dt, step)
}

fn call_destroy(class: &Class, this: &mut dyn MyriadObject) -> MyriadResult<()> {
    let method = resolve(class, Selector::Destroy)?;
    match method.entry() {
        Entry::Destroy(f) => f(this),
        _ => Err(mismatch(&method, Selector::Destroy).into()),
    }
}

/// Runs the destructor chain of `this`'s concrete class.
///
/// Callers go through [`crate::object::destroy`], which guards against running
/// the chain twice.
pub(crate) fn invoke_destroy(this: &mut dyn MyriadObject) -> MyriadResult<()> {
    let class = Arc::clone(this.header().class());
    call_destroy(&class, this)
}

/// Continues a destructor chain at `class`'s superclass.
///
/// The root is its own superclass, so a destructor on the root must not chain
/// further.
pub fn invoke_super_destroy(class: &Class, this: &mut dyn MyriadObject) -> MyriadResult<()> {
    call_destroy(class.super_ref(), this)
}
