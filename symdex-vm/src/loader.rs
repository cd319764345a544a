//! Class loading for emulated reflection.

use std::fmt::{self, Display};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::class::ClassManager;
use crate::value::TypeName;

/// A handle to a class that has been loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedClass {
    name: TypeName,
}

impl LoadedClass {
    /// Returns the loaded class's descriptor.
    #[must_use]
    pub const fn name(&self) -> &TypeName {
        &self.name
    }
}

/// A class could not be found by its binary name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNotFound(pub String);

impl Display for ClassNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class not found: {}", self.0)
    }
}

impl std::error::Error for ClassNotFound {}

/// Resolves binary class names against the program and the framework
/// classes the engine knows.
///
/// Successful lookups are cached. The cache is shared by every execution
/// path; loading a class has no effect on a path's state.
#[derive(Debug)]
pub struct ClassLoader {
    classes: Arc<ClassManager>,
    loaded: Mutex<AHashMap<String, LoadedClass>>,
}

impl ClassLoader {
    /// Returns a loader for the classes in `classes`.
    #[must_use]
    pub fn new(classes: Arc<ClassManager>) -> Self {
        Self {
            classes,
            loaded: Mutex::default(),
        }
    }

    /// Loads the class with the Java binary name `binary_name`, such as
    /// `java.lang.String` or `[I`.
    pub fn load_class(&self, binary_name: &str) -> Result<LoadedClass, ClassNotFound> {
        if let Some(loaded) = self.loaded.lock().get(binary_name) {
            return Ok(loaded.clone());
        }

        let name = TypeName::from_binary_name(binary_name);
        if !self.is_loadable(&name) {
            debug!(class = binary_name, "class not found");
            return Err(ClassNotFound(binary_name.to_string()));
        }

        trace!(class = binary_name, "loaded class");
        let loaded = LoadedClass { name };
        self.loaded
            .lock()
            .insert(binary_name.to_string(), loaded.clone());
        Ok(loaded)
    }

    fn is_loadable(&self, name: &TypeName) -> bool {
        let mut element = name.clone();
        while element.is_array() {
            element = element.inner_type();
        }
        element.is_primitive() || self.classes.is_known(&element)
    }
}
