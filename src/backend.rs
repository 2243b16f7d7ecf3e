//! Backends that turn a [`ProxyClassIr`] into a defined class and build
//! instances of it.

use anyhow::{Context, Result, bail};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::classfile::{
    ClassDescriptor, Constant, RawClass, decode_modified_utf8, encode_modified_utf8, read_class,
};
use crate::generator::GeneratedClass;
use crate::instance::ProxyArg;
use crate::ir::{ProxyClassIr, remap_descriptor};

pub type InstanceRef = Arc<dyn Any + Send + Sync>;

pub type ConstructorFn = Box<dyn Fn(&GeneratedClass, &[ProxyArg]) -> Result<InstanceRef> + Send + Sync>;

/// A compiled class, with everything nested under it compiled alongside.
#[derive(Debug, Clone)]
pub struct DefinedClass {
    pub name: String,
    pub bytes: Vec<u8>,
    pub descriptor: ClassDescriptor,
    pub nested: Vec<DefinedClass>,
}

impl DefinedClass {
    pub fn nested_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for n in &self.nested {
            names.push(n.name.clone());
            names.extend(n.nested_names());
        }
        names
    }
}

pub trait ClassBackend: Send + Sync {
    fn define(&self, ir: &ProxyClassIr) -> Result<DefinedClass>;

    fn construct(&self, class: &GeneratedClass, args: &[ProxyArg]) -> Result<InstanceRef>;
}

/// Compiles IR by rewriting constant-pool names in the source bytes.
///
/// Construction goes through factories registered per class name and exact
/// argument type signature.
#[derive(Default)]
pub struct RemapBackend {
    constructors: HashMap<(String, Vec<String>), ConstructorFn>,
    defined: AtomicUsize,
}

impl RemapBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor for `class_name` taking arguments whose type
    /// names are `signature` (see [`ProxyArg::type_name`]).
    pub fn constructor<F>(mut self, class_name: &str, signature: &[&str], factory: F) -> Self
    where
        F: Fn(&GeneratedClass, &[ProxyArg]) -> Result<InstanceRef> + Send + Sync + 'static,
    {
        let key = (
            class_name.to_string(),
            signature.iter().map(|s| s.to_string()).collect(),
        );
        self.constructors.insert(key, Box::new(factory));
        self
    }

    /// Classes compiled so far, nested ones included.
    pub fn defined_count(&self) -> usize {
        self.defined.load(Ordering::SeqCst)
    }

    fn compile(&self, ir: &ProxyClassIr) -> Result<DefinedClass> {
        let bytes = remap_class(ir)?;
        let descriptor = read_class(&bytes)
            .with_context(|| format!("rewritten class {} does not parse", ir.name))?;
        if descriptor.name != ir.name {
            bail!("rewritten class is named {}, expected {}", descriptor.name, ir.name);
        }
        let nested = ir
            .nested
            .iter()
            .map(|n| self.compile(n))
            .collect::<Result<Vec<_>>>()?;
        self.defined.fetch_add(1, Ordering::SeqCst);
        debug!(class = %ir.name, relocations = ir.relocations.len(), "class compiled");
        Ok(DefinedClass {
            name: ir.name.clone(),
            bytes,
            descriptor,
            nested,
        })
    }
}

impl ClassBackend for RemapBackend {
    fn define(&self, ir: &ProxyClassIr) -> Result<DefinedClass> {
        self.compile(ir)
    }

    fn construct(&self, class: &GeneratedClass, args: &[ProxyArg]) -> Result<InstanceRef> {
        let signature: Vec<String> = args.iter().map(|a| a.type_name().to_string()).collect();
        let key = (class.name().to_string(), signature);
        let Some(factory) = self.constructors.get(&key) else {
            bail!("no constructor {}({})", key.0, key.1.join(", "));
        };
        factory(class, args)
    }
}

fn remap_class(ir: &ProxyClassIr) -> Result<Vec<u8>> {
    let mut raw = RawClass::parse(&ir.source)
        .with_context(|| format!("failed to read {}", ir.name))?;
    if ir.relocations.is_empty() {
        return Ok(raw.to_bytes());
    }

    let class_slots = raw.pool.class_name_slots();
    for (index, constant) in raw.pool.iter_mut().enumerate() {
        let Constant::Utf8(bytes) = constant else {
            continue;
        };
        let text = decode_modified_utf8(bytes)?;
        let exact = if class_slots.contains(&index) {
            ir.relocations.get(&text).cloned()
        } else {
            None
        };
        if let Some(renamed) = exact.or_else(|| remap_descriptor(&text, &ir.relocations)) {
            let encoded = encode_modified_utf8(&renamed);
            if encoded.len() > u16::MAX as usize {
                bail!("relocated constant is too long: {renamed}");
            }
            *bytes = encoded;
        }
    }
    Ok(raw.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassFileBuilder;
    use crate::version::{MappingTable, VersionToken};

    fn lower(builder: ClassFileBuilder, table: &MappingTable) -> ProxyClassIr {
        ProxyClassIr::lower(builder.build(), table).unwrap()
    }

    #[test]
    fn define_rewrites_class_and_descriptor_references() {
        let table = MappingTable::new(VersionToken::parse("1.20.4").unwrap())
            .map("nms.Entity", "nms.v1_20_R3.Entity")
            .map("nms.World", "nms.v1_20_R3.World");
        let ir = lower(
            ClassFileBuilder::new("p.EngineImpl")
                .super_class("nms.Entity")
                .reference("nms.World")
                .method("world", "(Lnms/World;[Lnms/Entity;)V", &[]),
            &table,
        );

        let backend = RemapBackend::new();
        let defined = backend.define(&ir).unwrap();
        assert_eq!(defined.name, "p.EngineImpl");
        assert_eq!(defined.descriptor.super_name.as_deref(), Some("nms.v1_20_R3.Entity"));
        assert!(defined.descriptor.referenced_classes.contains("nms.v1_20_R3.World"));
        assert!(!defined.descriptor.referenced_classes.contains("nms.World"));
        assert_eq!(
            defined.descriptor.methods[0].descriptor,
            "(Lnms/v1_20_R3/World;[Lnms/v1_20_R3/Entity;)V"
        );
        assert_eq!(backend.defined_count(), 1);
    }

    #[test]
    fn define_rewrites_call_site_descriptors() {
        let table = MappingTable::new(VersionToken::parse("1.20.4").unwrap())
            .map("nms.Entity", "nms.v1_20_R3.Entity");
        let ir = lower(
            ClassFileBuilder::new("p.SpawnerImpl").call_site("spawn", "(Lnms/Entity;)V"),
            &table,
        );
        assert_eq!(ir.relocations["nms/Entity"], "nms/v1_20_R3/Entity");

        let defined = RemapBackend::new().define(&ir).unwrap();
        let raw = RawClass::parse(&defined.bytes).unwrap();
        let texts = raw.pool.utf8_texts().unwrap();
        assert!(texts.iter().any(|t| t == "(Lnms/v1_20_R3/Entity;)V"));
        assert!(!texts.iter().any(|t| t.contains("Lnms/Entity;")));
    }

    #[test]
    fn define_without_relocations_keeps_bytes() {
        let table = MappingTable::new(VersionToken::parse("V1").unwrap());
        let bytes = ClassFileBuilder::new("p.Plain").build();
        let ir = ProxyClassIr::lower(bytes.clone(), &table).unwrap();
        assert_eq!(RemapBackend::new().define(&ir).unwrap().bytes, bytes);
    }

    #[test]
    fn nested_classes_compile_with_their_outer() {
        let table = MappingTable::new(VersionToken::parse("V1").unwrap());
        let ir = lower(ClassFileBuilder::new("p.Impl"), &table).with_nested(vec![
            lower(ClassFileBuilder::new("p.Impl$Helper"), &table),
        ]);
        let backend = RemapBackend::new();
        let defined = backend.define(&ir).unwrap();
        assert_eq!(defined.nested_names(), vec!["p.Impl$Helper".to_string()]);
        assert_eq!(backend.defined_count(), 2);
    }

    #[test]
    fn corrupt_source_fails_to_define() {
        let table = MappingTable::new(VersionToken::parse("V1").unwrap());
        let mut ir = lower(ClassFileBuilder::new("p.Impl"), &table);
        ir.source.truncate(12);
        assert!(RemapBackend::new().define(&ir).is_err());
    }
}
