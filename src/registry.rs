//! Class registry.
//!
//! Holds the single [`Class`] record per class name. Classes are created once,
//! superclass before subclass, and live as long as the registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::class::{Class, ClassId, ClassSpec};
use crate::error::{ContractViolation, MyriadError, MyriadResult};
use crate::object;

fn lock_err(context: &'static str) -> MyriadError {
    MyriadError::internal(format!("poisoned lock: {context}"))
}

/// Registry of initialized classes.
#[derive(Debug)]
pub struct ClassRegistry {
    classes: RwLock<HashMap<ClassId, Arc<Class>>>,
    root: Arc<Class>,
}

impl ClassRegistry {
    /// Creates a registry holding only the root class.
    pub fn new() -> MyriadResult<Self> {
        let root = Arc::new(Class::from_spec(object::root_spec(), None)?);
        let mut classes = HashMap::new();
        classes.insert(root.id(), Arc::clone(&root));
        Ok(Self {
            classes: RwLock::new(classes),
            root,
        })
    }

    /// The root class.
    #[must_use]
    pub fn root(&self) -> &Arc<Class> {
        &self.root
    }

    /// Registers the class described by `spec`.
    ///
    /// Returns the class and whether this call created it. Registering a name
    /// that already exists returns the existing class unchanged.
    pub fn register(&self, spec: ClassSpec) -> MyriadResult<(Arc<Class>, bool)> {
        let id = spec.id();
        if let Some(existing) = self.get(id)? {
            debug!(class = existing.name(), "class already initialized");
            return Ok((existing, false));
        }

        let Some(super_name) = spec.superclass() else {
            return Err(MyriadError::internal(format!(
                "class '{}' has no superclass and is not the root",
                spec.name()
            )));
        };
        let Some(superclass) = self.get(ClassId::of(super_name))? else {
            error!(class = spec.name(), superclass = super_name, "class initialized before its superclass");
            return Err(ContractViolation::SuperclassNotInitialized {
                class: spec.name().to_string(),
                superclass: super_name.to_string(),
            }
            .into());
        };

        let mut classes = self.classes.write().map_err(|_| lock_err("register"))?;
        // Another caller may have registered it while the read lock was released.
        if let Some(existing) = classes.get(&id) {
            return Ok((Arc::clone(existing), false));
        }
        let class = Arc::new(Class::from_spec(spec, Some(superclass))?);
        classes.insert(id, Arc::clone(&class));
        Ok((class, true))
    }

    /// Looks up a class by id.
    pub fn get(&self, id: ClassId) -> MyriadResult<Option<Arc<Class>>> {
        let classes = self.classes.read().map_err(|_| lock_err("get"))?;
        Ok(classes.get(&id).cloned())
    }

    /// Looks up a class by name, failing if it was never initialized.
    pub fn require(&self, name: &str) -> MyriadResult<Arc<Class>> {
        self.get(ClassId::of(name))?.ok_or_else(|| {
            ContractViolation::ClassNotInitialized {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// True if `class` is the record this registry holds for its name.
    pub fn contains(&self, class: &Arc<Class>) -> MyriadResult<bool> {
        Ok(self
            .get(class.id())?
            .is_some_and(|held| Arc::ptr_eq(&held, class)))
    }

    /// Number of registered classes, the root included.
    pub fn len(&self) -> MyriadResult<usize> {
        let classes = self.classes.read().map_err(|_| lock_err("len"))?;
        Ok(classes.len())
    }

    /// Names of registered classes, sorted.
    pub fn names(&self) -> MyriadResult<Vec<String>> {
        let classes = self.classes.read().map_err(|_| lock_err("names"))?;
        let mut names: Vec<String> = classes.values().map(|c| c.name().to_string()).collect();
        names.sort();
        Ok(names)
    }
}
