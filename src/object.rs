//! Objects: the class-tag header, lifecycle, and type queries.
//!
//! Every object starts with an [`ObjectHeader`] naming its concrete class.
//! Concrete Rust layouts embed their parent layout first (the header, then the
//! parent's fields, then their own), so each layout is an ordered extension of
//! its superclass's layout.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::class::{Class, ClassSpec, Method, Selector};
use crate::device::image::{ImageReader, ImageWriter};
use crate::dispatch;
use crate::error::{DeviceError, MyriadResult};

/// Name of the root class.
pub const ROOT_CLASS_NAME: &str = "MyriadObject";

/// Unique identifier of an object instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Creates a new random object ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Constructed and usable.
    Live,
    /// The destruction chain has run.
    Destroyed,
}

/// Outcome of [`destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyStatus {
    /// The destruction chain ran.
    Destroyed,
    /// The object had already been destroyed; nothing ran.
    AlreadyDestroyed,
}

/// First field of every object.
#[derive(Debug)]
pub struct ObjectHeader {
    id: ObjectId,
    class: Arc<Class>,
    lifecycle: Lifecycle,
}

impl ObjectHeader {
    /// Bytes the header occupies in a device image (the class tag).
    pub const IMAGE_LEN: usize = 8;

    pub(crate) fn new(class: Arc<Class>) -> Self {
        Self {
            id: ObjectId::new(),
            class,
            lifecycle: Lifecycle::Live,
        }
    }

    /// Object id.
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Concrete class of the object.
    #[must_use]
    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// True once the destruction chain has run.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Destroyed)
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.lifecycle = Lifecycle::Destroyed;
    }
}

/// Behaviour shared by every object.
pub trait MyriadObject: Any + Send + Sync {
    /// The class-tag header.
    fn header(&self) -> &ObjectHeader;

    /// Mutable header.
    fn header_mut(&mut self) -> &mut ObjectHeader;

    /// Upcast for downcasting to the concrete layout.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete layout.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// This object as a plain object.
    fn as_object_mut(&mut self) -> &mut dyn MyriadObject;

    /// Writes the fields following the class tag, parent fields first.
    fn encode_payload(&self, image: &mut ImageWriter);

    /// Reads device-written state back after the class tag.
    ///
    /// Objects whose device copy is never written by device code keep the
    /// default, which reads nothing.
    fn decode_payload(&mut self, image: &mut ImageReader<'_>) -> Result<(), DeviceError> {
        let _ = image;
        Ok(())
    }
}

/// A Rust layout registered as a class.
pub trait MyriadType {
    /// Name of the class this layout is registered under.
    const CLASS_NAME: &'static str;

    /// Spec used the first time the class is initialized.
    fn class_spec() -> ClassSpec;
}

/// Construction chain for a layout.
///
/// `construct` runs the parent layout's construction first with the parent's
/// part of `args`, then initializes its own fields, so initialization always
/// proceeds root to leaf.
pub trait Construct: MyriadObject + MyriadType + Sized {
    /// Arguments consumed by this level and every level above it.
    type Args;

    /// Builds the object on top of an already tagged header.
    fn construct(header: ObjectHeader, args: Self::Args) -> Self;
}

/// Concrete class of `obj`.
pub fn class_of<O: MyriadObject + ?Sized>(obj: &O) -> &Arc<Class> {
    obj.header().class()
}

/// True iff `obj`'s class is the record `class`.
pub fn is_exact_type<O: MyriadObject + ?Sized>(obj: &O, class: &Class) -> bool {
    std::ptr::eq(Arc::as_ptr(class_of(obj)), class)
}

/// True iff `class` is in the superclass chain of `obj`'s class.
pub fn is_kind_of<O: MyriadObject + ?Sized>(obj: &O, class: &Class) -> bool {
    class_of(obj).is_subclass_of(class)
}

/// Instance size declared on `obj`'s class.
pub fn size_of<O: MyriadObject + ?Sized>(obj: &O) -> usize {
    class_of(obj).instance_size()
}

/// Runs the destruction chain, most-derived class first.
///
/// Storage is released when the owner drops the value. Destroying twice is
/// reported as [`DestroyStatus::AlreadyDestroyed`] and runs nothing.
pub fn destroy<O: MyriadObject + ?Sized>(obj: &mut O) -> MyriadResult<DestroyStatus> {
    if obj.header().is_destroyed() {
        return Ok(DestroyStatus::AlreadyDestroyed);
    }

    dispatch::invoke_destroy(obj.as_object_mut())?;

    if !obj.header().is_destroyed() {
        warn!(
            class = class_of(obj).name(),
            "destructor chain stopped before the root"
        );
        obj.header_mut().mark_destroyed();
    }
    Ok(DestroyStatus::Destroyed)
}

fn root_destroy(obj: &mut dyn MyriadObject) -> MyriadResult<()> {
    obj.header_mut().mark_destroyed();
    Ok(())
}

/// Spec of the root class.
pub(crate) fn root_spec() -> ClassSpec {
    ClassSpec::root(ROOT_CLASS_NAME)
        .instance_size(std::mem::size_of::<PlainObject>())
        .introduces(
            Selector::Destroy,
            Some(Method::destroy("myriad_object_destroy", root_destroy)),
        )
}

/// An instance of the root class with no payload.
#[derive(Debug)]
pub struct PlainObject {
    header: ObjectHeader,
}

impl MyriadObject for PlainObject {
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

    fn encode_payload(&self, _image: &mut ImageWriter) {}
}

impl MyriadType for PlainObject {
    const CLASS_NAME: &'static str = ROOT_CLASS_NAME;

    fn class_spec() -> ClassSpec {
        root_spec()
    }
}

impl Construct for PlainObject {
    type Args = ();

    fn construct(header: ObjectHeader, (): ()) -> Self {
        Self { header }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Arc<Class> {
        Arc::new(Class::from_spec(root_spec(), None).unwrap())
    }

    #[test]
    fn object_ids_are_unique() {
        assert_ne!(ObjectId::new(), ObjectId::new());
    }

    #[test]
    fn plain_object_queries() {
        let root = root();
        let obj = PlainObject::construct(ObjectHeader::new(Arc::clone(&root)), ());

        assert!(Arc::ptr_eq(class_of(&obj), &root));
        assert!(is_exact_type(&obj, &root));
        assert!(is_kind_of(&obj, &root));
        assert_eq!(size_of(&obj), std::mem::size_of::<PlainObject>());
        assert_eq!(obj.header().lifecycle(), Lifecycle::Live);
    }

    #[test]
    fn destroy_twice_reports_already_destroyed() {
        let root = root();
        let mut obj = PlainObject::construct(ObjectHeader::new(root), ());

        assert_eq!(destroy(&mut obj).unwrap(), DestroyStatus::Destroyed);
        assert!(obj.header().is_destroyed());
        assert_eq!(destroy(&mut obj).unwrap(), DestroyStatus::AlreadyDestroyed);
    }

    #[test]
    fn plain_object_has_empty_payload() {
        let root = root();
        let obj = PlainObject::construct(ObjectHeader::new(root), ());
        let mut image = ImageWriter::new();
        obj.encode_payload(&mut image);
        assert!(image.is_empty());
    }
}
