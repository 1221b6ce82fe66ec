//! # Myriad - single-inheritance objects for neural simulation
//!
//! Myriad is a small object runtime for simulation entities. Classes are
//! singleton records with a superclass link and per-class dispatch slots;
//! objects carry a tag naming their class. The same dispatch works on the
//! host and, after mirroring, on an accelerator.
//!
//! ## Core Concepts
//!
//! - **Class**: instance size, superclass, and dispatch slots
//! - **Object**: an instance whose header names its class
//! - **Mechanism**: a per-step current source (synapse, leak channel)
//! - **Compartment**: owns mechanisms and integrates their currents into a potential trace
//! - **Mirror**: a device-memory copy of a class or object with device-valid addresses
//!
//! ## Usage
//!
//! ```rust
//! use myriad::{
//!     Compartment, CompartmentArgs, CompartmentId, LeakArgs, LeakChannel, MechanismBase,
//!     Network, Runtime, RuntimeConfig,
//! };
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! runtime.init_type::<MechanismBase>(false)?;
//! runtime.init_type::<LeakChannel>(false)?;
//! runtime.init_type::<Compartment>(false)?;
//!
//! let id = CompartmentId::new(0);
//! let mut soma = runtime.create::<Compartment>(CompartmentArgs {
//!     id,
//!     simulation_length: 50,
//!     initial_potential: -70.0,
//!     capacitance: 1.0,
//! })?;
//! let leak = runtime.create::<LeakChannel>(LeakArgs { source: id, g_leak: 0.8, e_rev: -65.0 })?;
//! soma.add_mechanism(Box::new(leak))?;
//!
//! let mut network = Network::new();
//! network.push(soma)?;
//! network.run(&runtime.config().simulation)?;
//! # Ok::<(), myriad::MyriadError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

// Object model
pub mod class;
pub mod dispatch;
pub mod error;
pub mod object;
pub mod registry;

// Simulation entities
pub mod compartment;
pub mod mechanism;
pub mod network;

// Device and runtime
pub mod config;
pub mod device;
pub mod mirror;
pub mod runtime;

pub use class::{Class, ClassId, ClassSpec, Method, Selector, Slot};
pub use compartment::{Compartment, CompartmentArgs, CompartmentId};
pub use config::{DeviceConfig, RuntimeConfig, SimulationConfig};
pub use device::{Device, DeviceAddress, DeviceStream, SimulatedDevice, StepLaunch};
pub use dispatch::{
    invoke_compartment_step, invoke_mechanism_step, invoke_super_compartment_step,
    invoke_super_destroy, invoke_super_mechanism_step,
};
pub use error::{ConfigError, ContractViolation, DeviceError, MyriadError, MyriadResult};
pub use mechanism::{
    ConductanceSynapse, LeakArgs, LeakChannel, Mechanism, MechanismBase, SynapseArgs,
    SynapseParams,
};
pub use mirror::{MirrorEngine, MirrorReport, ObjectMirror};
pub use network::{DeviceBatch, Network};
pub use object::{
    class_of, destroy, is_exact_type, is_kind_of, size_of, Construct, DestroyStatus, MyriadObject,
    MyriadType, ObjectHeader, ObjectId, PlainObject,
};
pub use registry::ClassRegistry;
pub use runtime::Runtime;
