//! Networks: addressable collections of compartments and the step driver.
//!
//! A network resolves each mechanism's source compartment and steps every
//! compartment once per step. It can step on the host only, or evaluate every
//! mechanism on the device and integrate on the host. Both produce identical
//! traces.

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use crate::compartment::{accumulate, Compartment, CompartmentId};
use crate::config::SimulationConfig;
use crate::device::{LaunchEntry, StepLaunch};
use crate::dispatch;
use crate::error::{ContractViolation, MyriadResult};
use crate::mechanism::check_step;
use crate::mirror::ObjectMirror;
use crate::runtime::Runtime;

/// Compartments addressable by id, stepped in insertion order.
#[derive(Debug, Default)]
pub struct Network {
    compartments: Vec<Compartment>,
    index: HashMap<CompartmentId, usize>,
}

impl Network {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a compartment. Ids must be unique.
    pub fn push(&mut self, compartment: Compartment) -> MyriadResult<()> {
        let id = compartment.id();
        if self.index.contains_key(&id) {
            return Err(ContractViolation::DuplicateCompartment { id }.into());
        }
        self.index.insert(id, self.compartments.len());
        self.compartments.push(compartment);
        Ok(())
    }

    /// Looks up a compartment.
    #[must_use]
    pub fn get(&self, id: CompartmentId) -> Option<&Compartment> {
        self.index.get(&id).map(|&idx| &self.compartments[idx])
    }

    /// Looks up a compartment mutably.
    pub fn get_mut(&mut self, id: CompartmentId) -> Option<&mut Compartment> {
        self.index.get(&id).map(|&idx| &mut self.compartments[idx])
    }

    /// Number of compartments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.compartments.len()
    }

    /// True if the network has no compartments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compartments.is_empty()
    }

    /// Compartments in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Compartment> {
        self.compartments.iter()
    }

    /// Releases the compartments, in insertion order.
    #[must_use]
    pub fn into_compartments(self) -> Vec<Compartment> {
        self.compartments
    }

    fn index_of(&self, id: CompartmentId) -> MyriadResult<usize> {
        self.index
            .get(&id)
            .copied()
            .ok_or_else(|| ContractViolation::UnknownCompartment { id }.into())
    }

    /// Steps one compartment at `step`.
    pub fn step(&mut self, id: CompartmentId, dt: f64, global_time: f64, step: usize) -> MyriadResult<()> {
        let idx = self.index_of(id)?;
        self.step_at(idx, dt, global_time, step)
    }

    fn step_at(&mut self, idx: usize, dt: f64, global_time: f64, step: usize) -> MyriadResult<()> {
        check_step(step, self.compartments[idx].potentials().len())?;
        let mut mechanisms = self.compartments[idx].take_mechanisms();
        let current = accumulate(&mut mechanisms, &self.compartments[idx], self, dt, global_time, step);
        self.compartments[idx].restore_mechanisms(mechanisms);
        dispatch::invoke_compartment_step(&mut self.compartments[idx], current?, dt, step)
    }

    /// Steps every compartment at `step`, in insertion order.
    pub fn step_all(&mut self, dt: f64, global_time: f64, step: usize) -> MyriadResult<()> {
        for idx in 0..self.compartments.len() {
            self.step_at(idx, dt, global_time, step)?;
        }
        Ok(())
    }

    /// Runs steps `1..simulation_length` on the host. Returns the number of steps taken.
    #[instrument(skip_all, fields(compartments = self.compartments.len(), steps = config.simulation_length))]
    pub fn run(&mut self, config: &SimulationConfig) -> MyriadResult<usize> {
        for step in 1..config.simulation_length {
            self.step_all(config.dt, config.time_at(step), step)?;
        }
        info!("host run complete");
        Ok(config.simulation_length.saturating_sub(1))
    }

    /// Mirrors every mechanism, in stepping order.
    pub fn mirror_mechanisms(&self, runtime: &Runtime) -> MyriadResult<DeviceBatch> {
        let mut entries = Vec::new();
        for compartment in &self.compartments {
            for mechanism in compartment.mechanisms() {
                let mirror = runtime.mirror_object(&**mechanism)?;
                entries.push(BatchEntry {
                    compartment: compartment.id(),
                    source: mechanism.base().source_id(),
                    mirror,
                });
            }
        }
        debug!(mechanisms = entries.len(), "network mechanisms mirrored");
        Ok(DeviceBatch { entries })
    }

    fn check_batch(&self, batch: &DeviceBatch) -> MyriadResult<()> {
        let mut entries = batch.entries.iter();
        for compartment in &self.compartments {
            for mechanism in compartment.mechanisms() {
                let object = mechanism.header().id();
                match entries.next() {
                    Some(entry) if entry.mirror.object() == object => {}
                    Some(entry) => {
                        return Err(ContractViolation::MirrorMismatch {
                            mirror: entry.mirror.object(),
                            object,
                        }
                        .into())
                    }
                    None => {
                        return Err(ContractViolation::MirrorMismatch {
                            mirror: object,
                            object,
                        }
                        .into())
                    }
                }
            }
        }
        if let Some(extra) = entries.next() {
            return Err(ContractViolation::MirrorMismatch {
                mirror: extra.mirror.object(),
                object: extra.mirror.object(),
            }
            .into());
        }
        Ok(())
    }

    /// Steps every compartment at `step`, evaluating mechanisms on the device.
    ///
    /// Returns once the launch has completed, so the next step observes every
    /// device write of this one.
    pub fn step_all_on_device(
        &mut self,
        runtime: &Runtime,
        batch: &DeviceBatch,
        dt: f64,
        global_time: f64,
        step: usize,
    ) -> MyriadResult<()> {
        self.check_batch(batch)?;
        for compartment in &self.compartments {
            check_step(step, compartment.potentials().len())?;
        }

        let mut entries = Vec::with_capacity(batch.len());
        for entry in &batch.entries {
            let post = self.index_of(entry.compartment)?;
            let pre = self.index_of(entry.source)?;
            entries.push(LaunchEntry {
                mechanism: entry.mirror.address(),
                pre_potential: self.compartments[pre].potential_at(step - 1)?,
                post_potential: self.compartments[post].potential_at(step - 1)?,
            });
        }

        let currents = runtime.launch(StepLaunch {
            dt,
            global_time,
            step,
            entries,
        })?;

        let mut totals = vec![0.0; self.compartments.len()];
        for (entry, current) in batch.entries.iter().zip(currents) {
            totals[self.index_of(entry.compartment)?] += current;
        }
        for (compartment, total) in self.compartments.iter_mut().zip(totals) {
            dispatch::invoke_compartment_step(compartment, total, dt, step)?;
        }
        Ok(())
    }

    /// Copies device-written mechanism state back into the host mechanisms.
    pub fn sync_mechanisms(&mut self, runtime: &Runtime, batch: &DeviceBatch) -> MyriadResult<()> {
        self.check_batch(batch)?;
        let mut entries = batch.entries.iter();
        for compartment in &mut self.compartments {
            for mechanism in compartment.mechanisms_mut() {
                if let Some(entry) = entries.next() {
                    runtime.sync_from_device(&mut **mechanism, &entry.mirror)?;
                }
            }
        }
        Ok(())
    }

    /// Runs steps `1..simulation_length` with mechanisms on the device.
    ///
    /// Mechanism state is copied back and every mirror released before returning.
    #[instrument(skip_all, fields(compartments = self.compartments.len(), steps = config.simulation_length))]
    pub fn run_on_device(&mut self, runtime: &Runtime, config: &SimulationConfig) -> MyriadResult<usize> {
        let batch = self.mirror_mechanisms(runtime)?;
        for step in 1..config.simulation_length {
            self.step_all_on_device(runtime, &batch, config.dt, config.time_at(step), step)?;
        }
        self.sync_mechanisms(runtime, &batch)?;
        batch.release(runtime)?;
        info!("device run complete");
        Ok(config.simulation_length.saturating_sub(1))
    }
}

/// One mirrored mechanism and where it sits in the network.
#[derive(Debug, Clone, Copy)]
pub struct BatchEntry {
    /// Owning compartment.
    pub compartment: CompartmentId,
    /// Source compartment.
    pub source: CompartmentId,
    /// Device copy of the mechanism.
    pub mirror: ObjectMirror,
}

/// Device copies of a network's mechanisms, in stepping order.
///
/// The batch owns the device copies; they stay allocated until
/// [`DeviceBatch::release`].
#[derive(Debug)]
pub struct DeviceBatch {
    entries: Vec<BatchEntry>,
}

impl DeviceBatch {
    /// Entries in stepping order.
    #[must_use]
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Number of mirrored mechanisms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the network had no mechanisms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Frees every device copy.
    pub fn release(self, runtime: &Runtime) -> MyriadResult<()> {
        for entry in self.entries {
            runtime.release_mirror(entry.mirror)?;
        }
        Ok(())
    }
}
