//! Device mirroring of classes and objects.
//!
//! Mirroring a class is a two-phase build. Phase one makes sure the superclass
//! has a device mirror, recursing toward the root; phase two writes the class
//! image with its superclass link pointing at that already-built mirror. The
//! mirror address is cached on the class, so every class is written to the
//! device at most once and every superclass link is written exactly once, by
//! the call that builds the class owning it.
//!
//! Slots whose method has a device counterpart carry the address read from the
//! counterpart's device symbol. Each symbol is read once per engine. Slots
//! without a counterpart are written as NULL; launching through them fails on
//! the device.
//!
//! Object mirrors are owned by the caller and released explicitly with
//! [`MirrorEngine::release`]. Destroying the host object does not touch them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, instrument};

use crate::class::{Class, ClassId};
use crate::device::image::{ClassImage, ImageReader, ImageWriter};
use crate::device::{Device, DeviceAddress};
use crate::error::{ContractViolation, DeviceError, MyriadError, MyriadResult};
use crate::object::{MyriadObject, ObjectId};

/// Suffix of the device symbol a mirrored class is published under.
pub const CLASS_SYMBOL_SUFFIX: &str = "_dev_t";

/// Device symbol under which `class_name`'s mirror address is published.
#[must_use]
pub fn class_symbol(class_name: &str) -> String {
    format!("{class_name}{CLASS_SYMBOL_SUFFIX}")
}

fn lock_err(context: &'static str) -> MyriadError {
    MyriadError::internal(format!("poisoned lock: {context}"))
}

fn device_failure(operation: &'static str, err: DeviceError) -> MyriadError {
    error!(operation, %err, "device operation failed");
    err.into()
}

/// What a class mirroring call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorReport {
    /// Class that was asked for.
    pub class: String,
    /// Its device mirror.
    pub address: DeviceAddress,
    /// Classes written to the device by this call, root first.
    pub mirrored: Vec<String>,
    /// Classes whose existing mirror was reused, nearest first.
    pub reused: Vec<String>,
    /// Superclass links written by this call. The root's self link is not counted.
    pub links_patched: usize,
    /// Slots written with a device entry address.
    pub slots_rewritten: usize,
}

/// Device copy of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjectMirror {
    address: DeviceAddress,
    len: usize,
    class: ClassId,
    object: ObjectId,
}

impl ObjectMirror {
    /// Device address of the object image.
    #[must_use]
    pub const fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Image length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for an image of zero bytes. Never the case: an image holds at least its class tag.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Class of the mirrored object.
    #[must_use]
    pub const fn class(&self) -> ClassId {
        self.class
    }

    /// Id of the mirrored object.
    #[must_use]
    pub const fn object(&self) -> ObjectId {
        self.object
    }
}

/// Writes classes and objects into device memory.
#[derive(Debug)]
pub struct MirrorEngine {
    device: Arc<dyn Device>,
    entries: Mutex<HashMap<&'static str, DeviceAddress>>,
    build: Mutex<()>,
}

impl MirrorEngine {
    /// Creates an engine for `device`, which must be available.
    pub fn new(device: Arc<dyn Device>) -> MyriadResult<Self> {
        if !device.is_available() {
            return Err(device_failure(
                "availability",
                DeviceError::Unavailable {
                    name: device.name().to_string(),
                },
            ));
        }
        Ok(Self {
            device,
            entries: Mutex::new(HashMap::new()),
            build: Mutex::new(()),
        })
    }

    /// The target device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Mirrors `class` and any ancestor not yet mirrored.
    #[instrument(skip_all, fields(class = class.name()))]
    pub fn mirror_class(&self, class: &Arc<Class>) -> MyriadResult<MirrorReport> {
        let _guard = self.build.lock().map_err(|_| lock_err("mirror_class"))?;
        let mut report = MirrorReport {
            class: class.name().to_string(),
            address: DeviceAddress::NULL,
            mirrored: Vec::new(),
            reused: Vec::new(),
            links_patched: 0,
            slots_rewritten: 0,
        };
        report.address = self.ensure_class(class, &mut report)?;
        if !report.mirrored.is_empty() {
            info!(
                class = class.name(),
                address = %report.address,
                mirrored = report.mirrored.len(),
                links = report.links_patched,
                "class mirrored"
            );
        }
        Ok(report)
    }

    fn ensure_class(&self, class: &Arc<Class>, report: &mut MirrorReport) -> MyriadResult<DeviceAddress> {
        if let Some(address) = class.device_mirror() {
            report.reused.push(class.name().to_string());
            return Ok(address);
        }

        // Phase one: every ancestor has a mirror before this class is written.
        let super_link = if class.is_root() {
            None
        } else {
            Some(self.ensure_class(&class.superclass(), report)?)
        };

        // Phase two: build this class against the ancestor addresses.
        let mut slots = Vec::with_capacity(class.slots().len());
        for slot in class.slots() {
            let entry = match slot.method.and_then(|m| m.device_symbol()) {
                Some(symbol) => {
                    report.slots_rewritten += 1;
                    self.device_entry(symbol)?
                }
                None => DeviceAddress::NULL,
            };
            slots.push((slot.selector, entry));
        }

        let len = ClassImage::encoded_len(slots.len());
        let address = self
            .device
            .allocate(len)
            .map_err(|err| device_failure("allocate class", err))?;
        let image = ClassImage {
            super_link: super_link.unwrap_or(address),
            instance_size: class.instance_size() as u64,
            slots,
        };
        self.device
            .copy_to_device(address, &image.encode())
            .map_err(|err| device_failure("copy class", err))?;

        if let Err(existing) = class.set_device_mirror(address) {
            // Mirrored through another engine in the meantime; keep the first copy.
            self.device
                .free(address)
                .map_err(|err| device_failure("free duplicate class", err))?;
            report.reused.push(class.name().to_string());
            return Ok(existing);
        }

        self.device
            .write_symbol(&class_symbol(class.name()), address)
            .map_err(|err| device_failure("publish class", err))?;
        if super_link.is_some() {
            report.links_patched += 1;
        }
        report.mirrored.push(class.name().to_string());
        debug!(class = class.name(), %address, super_link = %image.super_link, "class image written");
        Ok(address)
    }

    /// Device address of the code behind `symbol`, read from the device once.
    fn device_entry(&self, symbol: &'static str) -> MyriadResult<DeviceAddress> {
        let mut entries = self.entries.lock().map_err(|_| lock_err("device_entry"))?;
        if let Some(address) = entries.get(symbol) {
            return Ok(*address);
        }
        let address = self
            .device
            .read_symbol(symbol)
            .map_err(|err| device_failure("read symbol", err))?;
        entries.insert(symbol, address);
        Ok(address)
    }

    /// Mirrors `object`, mirroring its class first if needed.
    #[instrument(skip_all, fields(object = %object.header().id()))]
    pub fn mirror_object<O: MyriadObject + ?Sized>(&self, object: &O) -> MyriadResult<ObjectMirror> {
        let header = object.header();
        if header.is_destroyed() {
            return Err(ContractViolation::AlreadyDestroyed { id: header.id() }.into());
        }

        let class = header.class();
        let class_address = match class.device_mirror() {
            Some(address) => address,
            None => self.mirror_class(class)?.address,
        };

        let mut image = ImageWriter::new();
        image.put_address(class_address);
        object.encode_payload(&mut image);
        let bytes = image.into_bytes();

        let address = self
            .device
            .allocate(bytes.len())
            .map_err(|err| device_failure("allocate object", err))?;
        self.device
            .copy_to_device(address, &bytes)
            .map_err(|err| device_failure("copy object", err))?;

        debug!(class = class.name(), %address, len = bytes.len(), "object mirrored");
        Ok(ObjectMirror {
            address,
            len: bytes.len(),
            class: class.id(),
            object: header.id(),
        })
    }

    /// Reads device-written state of `object` back from `mirror`.
    pub fn sync_from_device<O: MyriadObject + ?Sized>(
        &self,
        object: &mut O,
        mirror: &ObjectMirror,
    ) -> MyriadResult<()> {
        let id = object.header().id();
        if mirror.object != id {
            return Err(ContractViolation::MirrorMismatch {
                mirror: mirror.object,
                object: id,
            }
            .into());
        }

        let bytes = self
            .device
            .copy_from_device(mirror.address, mirror.len)
            .map_err(|err| device_failure("copy object back", err))?;
        let mut reader = ImageReader::new(&bytes);
        let tag = reader.get_address()?;
        let expected = object.header().class().device_mirror();
        if Some(tag) != expected {
            return Err(device_failure(
                "sync object",
                DeviceError::MalformedImage {
                    offset: 0,
                    reason: format!("class tag {tag} does not match the class mirror"),
                },
            ));
        }
        object.decode_payload(&mut reader)?;
        Ok(())
    }

    /// Frees the device copy behind `mirror`.
    pub fn release(&self, mirror: ObjectMirror) -> MyriadResult<()> {
        self.device
            .free(mirror.address)
            .map_err(|err| device_failure("release object", err))?;
        debug!(address = %mirror.address, object = %mirror.object, "object mirror released");
        Ok(())
    }
}
