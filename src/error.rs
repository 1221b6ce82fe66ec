//! Error types for Myriad.
//!
//! Errors fall into three families:
//! - [`ContractViolation`]: the caller broke a precondition of the object model
//!   (unset dispatch slot, wrong initialization order, mismatched layouts).
//! - [`DeviceError`]: the accelerator is missing, exhausted, or misbehaved.
//! - [`ConfigError`]: configuration could not be loaded or is invalid.
//!
//! Contract and device errors are fatal. Nothing in the runtime retries them and
//! a failed mirroring or launch leaves device state unspecified.

use thiserror::Error;

use crate::class::Selector;
use crate::compartment::CompartmentId;
use crate::device::DeviceAddress;
use crate::object::ObjectId;

/// Caller errors against the object model.
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("Dispatch slot '{selector}' is unset on class '{class}'")]
    UnsetSlot {
        class: String,
        selector: Selector,
    },

    #[error("Class '{class}' does not declare selector '{selector}'")]
    UndeclaredSelector {
        class: String,
        selector: Selector,
    },

    #[error("Method '{symbol}' does not match the signature of selector '{selector}'")]
    SignatureMismatch {
        symbol: String,
        selector: Selector,
    },

    #[error("Class '{name}' is not initialized")]
    ClassNotInitialized {
        name: String,
    },

    #[error("Superclass '{superclass}' must be initialized before '{class}'")]
    SuperclassNotInitialized {
        class: String,
        superclass: String,
    },

    #[error("Class '{class}' declares {declared} bytes but the layout needs {actual} bytes")]
    LayoutMismatch {
        class: String,
        declared: usize,
        actual: usize,
    },

    #[error("Class '{class}' is not a kind of '{expected}'")]
    TypeMismatch {
        class: String,
        expected: String,
    },

    #[error("Object {id} was already destroyed")]
    AlreadyDestroyed {
        id: ObjectId,
    },

    #[error("Step index {step} is outside a trace of length {len}")]
    StepOutOfRange {
        step: usize,
        len: usize,
    },

    #[error("Compartment {id} is not part of the network")]
    UnknownCompartment {
        id: CompartmentId,
    },

    #[error("Compartment {id} is already part of the network")]
    DuplicateCompartment {
        id: CompartmentId,
    },

    #[error("Mechanism {id} is already attached to compartment {compartment}")]
    DuplicateMechanism {
        id: ObjectId,
        compartment: CompartmentId,
    },

    #[error("Compartment {id} has unusable capacitance {capacitance}")]
    InvalidCapacitance {
        id: CompartmentId,
        capacitance: f64,
    },

    #[error("Mirror of object {mirror} cannot be applied to object {object}")]
    MirrorMismatch {
        mirror: ObjectId,
        object: ObjectId,
    },
}

/// Accelerator and device-memory failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Accelerator '{name}' is unavailable")]
    Unavailable {
        name: String,
    },

    #[error("Device allocation of {requested} bytes failed ({available} bytes available)")]
    AllocationFailed {
        requested: usize,
        available: usize,
    },

    #[error("Transfer of {len} bytes at {address} failed: {reason}")]
    TransferFailed {
        address: DeviceAddress,
        len: usize,
        reason: String,
    },

    #[error("Device symbol '{symbol}' not found")]
    SymbolNotFound {
        symbol: String,
    },

    #[error("Invalid device address {address}")]
    InvalidAddress {
        address: DeviceAddress,
    },

    #[error("Malformed device image at offset {offset}: {reason}")]
    MalformedImage {
        offset: usize,
        reason: String,
    },

    #[error("Kernel launch failed: {reason}")]
    LaunchFailed {
        reason: String,
    },

    #[error("Launch queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Device stream disconnected")]
    Disconnected,

    #[error("Launch did not complete within {duration_ms} ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {reason}")]
    Invalid {
        reason: String,
    },

    #[error("Failed to read configuration: {message}")]
    Io {
        message: String,
    },

    #[error("Failed to parse configuration: {message}")]
    Parse {
        message: String,
    },
}

/// Top-level error type for Myriad.
#[derive(Debug, Error)]
pub enum MyriadError {
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl MyriadError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a contract violation.
    #[must_use]
    pub const fn is_contract(&self) -> bool {
        matches!(self, Self::Contract(_))
    }

    /// Returns true if this is a device error.
    #[must_use]
    pub const fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if the process must stop after this error.
    ///
    /// Contract violations and device failures are never recoverable. A
    /// configuration error can be fixed and the runtime rebuilt.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Contract(_) | Self::Device(_) | Self::Internal { .. } => true,
            Self::Config(_) => false,
        }
    }
}

/// Result type alias for Myriad operations.
pub type MyriadResult<T> = Result<T, MyriadError>;
