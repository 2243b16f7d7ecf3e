//! Singleton proxy instances keyed by contract, pattern and argument types.

use parking_lot::Mutex;
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::InstanceRef;
use crate::error::{ProxyError, Result};
use crate::generator::{Contract, GeneratedClass, ProxyClassGenerator};

/// A constructor argument together with the name of its runtime type.
#[derive(Clone)]
pub struct ProxyArg {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl ProxyArg {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for ProxyArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProxyArg").field(&self.type_name).finish()
    }
}

/// Rendered as `contract:pattern:type,type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub contract: Contract,
    pub pattern: String,
    pub arg_types: Vec<&'static str>,
}

impl BindingKey {
    pub fn new(contract: &Contract, pattern: &str, args: &[ProxyArg]) -> Self {
        Self {
            contract: contract.clone(),
            pattern: pattern.to_string(),
            arg_types: args.iter().map(ProxyArg::type_name).collect(),
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.contract, self.pattern, self.arg_types.join(","))
    }
}

#[derive(Clone)]
pub struct Instance {
    key: BindingKey,
    class: Arc<GeneratedClass>,
    value: InstanceRef,
}

impl Instance {
    pub fn key(&self) -> &BindingKey {
        &self.key
    }

    pub fn class(&self) -> &Arc<GeneratedClass> {
        &self.class
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// Same underlying object.
    pub fn ptr_eq(a: &Instance, b: &Instance) -> bool {
        Arc::ptr_eq(&a.value, &b.value)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("key", &self.key.to_string())
            .field("class", &self.class.name())
            .finish()
    }
}

pub struct ProxyInstanceCache {
    generator: Arc<ProxyClassGenerator>,
    instances: Mutex<HashMap<BindingKey, Instance>>,
}

impl ProxyInstanceCache {
    pub fn new(generator: Arc<ProxyClassGenerator>) -> Self {
        Self {
            generator,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn generator(&self) -> &Arc<ProxyClassGenerator> {
        &self.generator
    }

    pub fn instantiate(&self, contract: &Contract, pattern: &str, args: &[ProxyArg]) -> Result<Instance> {
        self.instantiate_with_parents(contract, pattern, &[], args)
    }

    /// Parent patterns are synthesized (not instantiated) before the primary
    /// class. The instance lock is taken before the generator's class lock.
    pub fn instantiate_with_parents(
        &self,
        contract: &Contract,
        pattern: &str,
        parents: &[&str],
        args: &[ProxyArg],
    ) -> Result<Instance> {
        let key = BindingKey::new(contract, pattern, args);
        let mut instances = self.instances.lock();
        if let Some(hit) = instances.get(&key) {
            debug!(key = %key, "proxy instance cache hit");
            return Ok(hit.clone());
        }

        let class = self.generator.resolve_with_parents(contract, pattern, parents)?;
        let value = self
            .generator
            .backend()
            .construct(&class, args)
            .map_err(|e| ProxyError::Instantiation {
                name: class.name().to_string(),
                reason: format!("{e:#}"),
            })?;
        info!(key = %key, class = %class.name(), "proxy instance constructed");

        let instance = Instance {
            key: key.clone(),
            class,
            value,
        };
        instances.insert(key, instance.clone());
        Ok(instance)
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RemapBackend;
    use crate::builder::ClassFileBuilder;
    use crate::classpath::{ClassSource, MemoryClasspath};
    use crate::index::IndexBuilder;
    use crate::version::{MappingTable, VersionToken};
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Engine: Send + Sync {
        fn power(&self) -> u32;
    }

    struct EngineV2 {
        power: u32,
    }

    impl Engine for EngineV2 {
        fn power(&self) -> u32 {
            self.power
        }
    }

    fn cache(constructed: Arc<AtomicUsize>) -> ProxyInstanceCache {
        let mut cp = MemoryClasspath::new();
        cp.insert_class(ClassFileBuilder::new("e.EngineImplV2").interface("e.Engine").build())
            .unwrap();
        cp.insert_class(ClassFileBuilder::new("e.EngineBase").build()).unwrap();
        let source: Arc<dyn ClassSource> = Arc::new(cp);
        let index = IndexBuilder::new().build(source.as_ref()).into_shared();

        let backend = RemapBackend::new()
            .constructor("e.EngineImplV2", &[type_name::<u32>()], move |_, args| {
                constructed.fetch_add(1, Ordering::SeqCst);
                let power = *args[0].get::<u32>().unwrap_or(&0);
                let engine: Arc<dyn Engine> = Arc::new(EngineV2 { power });
                Ok(Arc::new(engine) as InstanceRef)
            })
            .constructor("e.EngineImplV2", &[type_name::<String>()], |_, _| {
                anyhow::bail!("constructor threw")
            });
        let resolver = MappingTable::new(VersionToken::parse("V2").unwrap())
            .map("e.EngineImpl", "e.EngineImplV2");
        let generator = ProxyClassGenerator::new(source, index, Arc::new(resolver), Arc::new(backend));
        ProxyInstanceCache::new(Arc::new(generator))
    }

    #[test]
    fn equal_keys_share_one_instance() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let cache = cache(Arc::clone(&constructed));
        let contract = Contract::new("e.Engine");

        let a = cache.instantiate(&contract, "{name}Impl", &[ProxyArg::new(7u32)]).unwrap();
        let b = cache.instantiate(&contract, "{name}Impl", &[ProxyArg::new(9u32)]).unwrap();
        assert!(Instance::ptr_eq(&a, &b));
        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert_eq!(a.downcast::<Arc<dyn Engine>>().unwrap().power(), 7);
        assert_eq!(a.key().to_string(), "e.Engine:{name}Impl:u32");
        assert_eq!(a.class().name(), "e.EngineImplV2");
    }

    #[test]
    fn other_signature_does_not_fall_back() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let cache = cache(Arc::clone(&constructed));
        let contract = Contract::new("e.Engine");
        cache.instantiate(&contract, "{name}Impl", &[ProxyArg::new(7u32)]).unwrap();

        let err = cache
            .instantiate(&contract, "{name}Impl", &[ProxyArg::new(7i64)])
            .unwrap_err();
        assert!(matches!(err, ProxyError::Instantiation { ref name, .. } if name == "e.EngineImplV2"));
        assert!(err.to_string().contains("no constructor e.EngineImplV2(i64)"));

        let err = cache
            .instantiate(&contract, "{name}Impl", &[ProxyArg::new(String::from("x"))])
            .unwrap_err();
        assert!(err.to_string().contains("constructor threw"));

        // Failed constructions are not cached; the class is shared.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.generator().synthesized_count(), 1);
        assert_eq!(constructed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parents_are_resolved_but_not_instantiated() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let cache = cache(Arc::clone(&constructed));
        let contract = Contract::new("e.Engine");
        cache
            .instantiate_with_parents(&contract, "{name}Impl", &["{name}Base"], &[ProxyArg::new(1u32)])
            .unwrap();
        assert!(cache.generator().cached(&contract, "{name}Base").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unresolvable_binding_surfaces_not_found() {
        let cache = cache(Arc::new(AtomicUsize::new(0)));
        let err = cache
            .instantiate(&Contract::new("e.Gearbox"), "{name}Impl", &[])
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.is_empty());
    }
}
