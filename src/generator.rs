//! Resolves contracts to synthesized, version-bound classes.
//!
//! A binding pattern names the implementation of a contract (`{name}Impl`);
//! the version resolver maps that logical name to the class this host ships,
//! and the backend compiles it with its references relocated. Every class
//! nested under the target is synthesized with it, enumerated from the index.
//!
//! The class cache lock is held across lookup, synthesis and insert, so each
//! `(contract, pattern)` pair is synthesized at most once per generator.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{ClassBackend, DefinedClass};
use crate::classfile::{package_name, simple_name};
use crate::classpath::ClassSource;
use crate::error::{ProxyError, Result};
use crate::index::Index;
use crate::ir::ProxyClassIr;
use crate::version::{VersionResolver, resolve_target};

pub const DEFAULT_BINDING: &str = "{name}Impl";

/// The abstract type a proxy is resolved for, by binary name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Contract(String);

impl Contract {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn simple_name(&self) -> &str {
        simple_name(&self.0)
    }

    pub fn package(&self) -> Option<&str> {
        package_name(&self.0)
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Contract {
    fn from(name: &str) -> Self {
        Contract::new(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedClass {
    pub contract: Contract,
    pub pattern: String,
    /// Name after placeholder substitution, before version mapping.
    pub logical_name: String,
    pub relocations: BTreeMap<String, String>,
    #[serde(skip)]
    pub class: DefinedClass,
}

impl GeneratedClass {
    pub fn name(&self) -> &str {
        &self.class.name
    }

    pub fn nested_names(&self) -> Vec<String> {
        self.class.nested_names()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.class.bytes
    }
}

fn class_key(contract: &Contract, pattern: &str) -> String {
    format!("{}:{}", contract.name(), pattern)
}

pub struct ProxyClassGenerator {
    source: Arc<dyn ClassSource>,
    index: Arc<Index>,
    resolver: Arc<dyn VersionResolver>,
    backend: Arc<dyn ClassBackend>,
    classes: Mutex<HashMap<String, Arc<GeneratedClass>>>,
}

impl ProxyClassGenerator {
    pub fn new(
        source: Arc<dyn ClassSource>,
        index: Arc<Index>,
        resolver: Arc<dyn VersionResolver>,
        backend: Arc<dyn ClassBackend>,
    ) -> Self {
        Self {
            source,
            index,
            resolver,
            backend,
            classes: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ClassBackend> {
        &self.backend
    }

    pub fn resolver(&self) -> &Arc<dyn VersionResolver> {
        &self.resolver
    }

    pub fn resolve(&self, contract: &Contract, pattern: &str) -> Result<Arc<GeneratedClass>> {
        let key = class_key(contract, pattern);
        let mut classes = self.classes.lock();
        if let Some(hit) = classes.get(&key) {
            debug!(key = %key, class = %hit.name(), "proxy class cache hit");
            return Ok(Arc::clone(hit));
        }
        let generated = Arc::new(self.synthesize(contract, pattern)?);
        classes.insert(key, Arc::clone(&generated));
        Ok(generated)
    }

    /// Resolves each parent pattern first, then `pattern`. Parents are
    /// synthesized and cached but only the primary class is returned.
    pub fn resolve_with_parents(
        &self,
        contract: &Contract,
        pattern: &str,
        parents: &[&str],
    ) -> Result<Arc<GeneratedClass>> {
        for parent in parents {
            self.resolve(contract, parent)?;
        }
        self.resolve(contract, pattern)
    }

    pub fn cached(&self, contract: &Contract, pattern: &str) -> Option<Arc<GeneratedClass>> {
        self.classes.lock().get(&class_key(contract, pattern)).cloned()
    }

    pub fn synthesized_count(&self) -> usize {
        self.classes.lock().len()
    }

    fn synthesize(&self, contract: &Contract, pattern: &str) -> Result<GeneratedClass> {
        let start = Instant::now();
        let (logical_name, target) = resolve_target(pattern, contract.name(), self.resolver.as_ref())?;
        if !self.source.contains(&target) {
            return Err(ProxyError::NotFound(target));
        }

        let ir = self.lower(&target)?;
        let nested = self
            .index
            .nested_classes(&target)
            .iter()
            .map(|name| self.lower(name))
            .collect::<Result<Vec<_>>>()?;
        let ir = ir.with_nested(nested);

        let class = self
            .backend
            .define(&ir)
            .map_err(|e| ProxyError::Generation {
                name: target.clone(),
                reason: format!("{e:#}"),
            })?;

        let d = &class.descriptor;
        let implements = d.super_name.as_deref() == Some(contract.name())
            || d.interfaces.iter().any(|i| i == contract.name());
        if !implements {
            warn!(contract = %contract, class = %class.name, "synthesized class does not directly extend or implement its contract");
        }

        info!(
            contract = %contract,
            pattern,
            logical = %logical_name,
            class = %class.name,
            nested = ir.class_count() - 1,
            relocations = ir.relocations.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "proxy class synthesized"
        );
        Ok(GeneratedClass {
            contract: contract.clone(),
            pattern: pattern.to_string(),
            logical_name,
            relocations: ir.relocations.clone(),
            class,
        })
    }

    fn lower(&self, name: &str) -> Result<ProxyClassIr> {
        let bytes = self.source.read_class(name)?;
        ProxyClassIr::lower(bytes, self.resolver.as_ref()).map_err(|e| ProxyError::Generation {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}
