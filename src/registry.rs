use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::warn;

use crate::classfile::{ClassDescriptor, read_class};
use crate::classpath::ClassSource;
use crate::criterion::Category;
use crate::error::{ProxyError, Result};
use crate::index::Index;

/// A class materialized by a [`ClassLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedClass {
    pub descriptor: ClassDescriptor,
    pub size: usize,
}

impl LoadedClass {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

pub trait ClassLoader: Send + Sync {
    fn load_class(&self, name: &str) -> Result<LoadedClass>;
}

/// Loads classes by reading and parsing them from a classpath.
#[derive(Clone)]
pub struct ClasspathLoader {
    source: Arc<dyn ClassSource>,
}

impl ClasspathLoader {
    pub fn new(source: Arc<dyn ClassSource>) -> Self {
        Self { source }
    }
}

impl ClassLoader for ClasspathLoader {
    fn load_class(&self, name: &str) -> Result<LoadedClass> {
        let bytes = self.source.read_class(name)?;
        let descriptor = read_class(&bytes).map_err(|source| ProxyError::Malformed {
            name: name.to_string(),
            source,
        })?;
        Ok(LoadedClass {
            descriptor,
            size: bytes.len(),
        })
    }
}

/// Read-only view over a built [`Index`] that can also hand out loaded classes.
pub struct Registry {
    index: Arc<Index>,
    loader: Arc<dyn ClassLoader>,
    loaded: Mutex<HashMap<String, Arc<LoadedClass>>>,
}

impl Registry {
    pub fn new(index: Arc<Index>, loader: Arc<dyn ClassLoader>) -> Self {
        Self {
            index,
            loader,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn get(&self, category: &Category) -> &BTreeSet<String> {
        self.index.get(category)
    }

    /// Loads one class, caching the result per name. Failures are not cached.
    pub fn load(&self, name: &str) -> Result<Arc<LoadedClass>> {
        if let Some(hit) = self.loaded.lock().get(name) {
            return Ok(Arc::clone(hit));
        }
        let class = Arc::new(self.loader.load_class(name)?);
        let mut loaded = self.loaded.lock();
        let entry = loaded
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&class));
        Ok(Arc::clone(entry))
    }

    /// Loads every class in `category`. Names that fail to load are logged
    /// and left out of the result.
    pub fn materialize(&self, category: &Category) -> Vec<Arc<LoadedClass>> {
        self.materialize_names(self.index.get(category).iter())
    }

    /// Like [`Registry::materialize`] across every kind of one criterion.
    pub fn materialize_scope(&self, criterion: &str) -> Vec<Arc<LoadedClass>> {
        self.materialize_names(self.index.scope(criterion).iter())
    }

    fn materialize_names<'a>(&self, names: impl Iterator<Item = &'a String>) -> Vec<Arc<LoadedClass>> {
        names
            .filter_map(|name| match self.load(name) {
                Ok(class) => Some(class),
                Err(e) => {
                    warn!(class = %name, error = %e, "failed to load class");
                    None
                }
            })
            .collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().len()
    }
}
