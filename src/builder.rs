//! Emits minimal class definitions for in-memory classpaths.
//!
//! Methods are written abstract (no `Code` attribute), which keeps the output
//! structurally valid without an instruction encoder.

use std::collections::HashMap;

use crate::classfile::{
    ACC_ABSTRACT, ACC_PUBLIC, ACC_SUPER, CLASS_MAGIC, Constant, ConstantPool,
    encode_modified_utf8, internal_name,
};

const MAJOR_VERSION: u16 = 52;

#[derive(Debug, Clone)]
struct Annotation {
    type_name: String,
    values: Vec<(String, String)>,
    /// Array levels wrapped around a single `value = false` element.
    array_depth: usize,
}

impl Annotation {
    fn plain(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            values: Vec::new(),
            array_depth: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Member {
    name: String,
    descriptor: String,
    annotations: Vec<Annotation>,
}

#[derive(Debug, Clone)]
pub struct ClassFileBuilder {
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    annotations: Vec<Annotation>,
    fields: Vec<Member>,
    methods: Vec<Member>,
    references: Vec<String>,
    call_sites: Vec<(String, String)>,
    access_flags: u16,
}

impl ClassFileBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            super_name: Some("java.lang.Object".to_string()),
            interfaces: Vec::new(),
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            references: Vec::new(),
            call_sites: Vec::new(),
            access_flags: ACC_PUBLIC | ACC_SUPER,
        }
    }

    pub fn super_class(mut self, name: &str) -> Self {
        self.super_name = Some(name.to_string());
        self
    }

    /// Root types (`java.lang.Object`) have no superclass.
    pub fn no_super(mut self) -> Self {
        self.super_name = None;
        self
    }

    pub fn interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn access_flags(mut self, flags: u16) -> Self {
        self.access_flags = flags;
        self
    }

    pub fn annotation(mut self, type_name: &str) -> Self {
        self.annotations.push(Annotation::plain(type_name));
        self
    }

    /// Type annotation carrying string elements, e.g. `@Header(name = "x")`.
    pub fn annotation_with(mut self, type_name: &str, values: &[(&str, &str)]) -> Self {
        self.annotations.push(Annotation {
            type_name: type_name.to_string(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            array_depth: 0,
        });
        self
    }

    /// Type annotation whose `value` element is `depth` nested arrays,
    /// e.g. depth 2 is `@T(value = {{false}})`.
    pub fn annotation_nested(mut self, type_name: &str, depth: usize) -> Self {
        self.annotations.push(Annotation {
            array_depth: depth,
            ..Annotation::plain(type_name)
        });
        self
    }

    pub fn method(mut self, name: &str, descriptor: &str, annotations: &[&str]) -> Self {
        self.methods.push(Member {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            annotations: annotations.iter().map(|a| Annotation::plain(a)).collect(),
        });
        self
    }

    pub fn field(mut self, name: &str, descriptor: &str, annotations: &[&str]) -> Self {
        self.fields.push(Member {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            annotations: annotations.iter().map(|a| Annotation::plain(a)).collect(),
        });
        self
    }

    /// Adds a `CONSTANT_Class` entry without otherwise using it, the way a
    /// method body referencing another type would.
    pub fn reference(mut self, name: &str) -> Self {
        self.references.push(name.to_string());
        self
    }

    /// Adds a `CONSTANT_NameAndType` entry, as an invocation in a method body
    /// would.
    pub fn call_site(mut self, name: &str, descriptor: &str) -> Self {
        self.call_sites.push((name.to_string(), descriptor.to_string()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut pool = PoolWriter::default();

        let this_index = pool.class(&self.name);
        let super_index = self.super_name.as_deref().map_or(0, |s| pool.class(s));
        let interface_indices: Vec<u16> = self.interfaces.iter().map(|i| pool.class(i)).collect();
        for r in &self.references {
            pool.class(r);
        }
        for (name, descriptor) in &self.call_sites {
            let name_index = pool.utf8(name);
            let descriptor_index = pool.utf8(descriptor);
            pool.pool.push(Constant::NameAndType(name_index, descriptor_index));
        }

        let fields: Vec<Vec<u8>> = self
            .fields
            .iter()
            .map(|f| write_member(&mut pool, f, ACC_PUBLIC))
            .collect();
        let methods: Vec<Vec<u8>> = self
            .methods
            .iter()
            .map(|m| write_member(&mut pool, m, ACC_PUBLIC | ACC_ABSTRACT))
            .collect();
        let class_attributes = write_annotation_attributes(&mut pool, &self.annotations);

        let mut access_flags = self.access_flags;
        if !self.methods.is_empty() {
            access_flags |= ACC_ABSTRACT;
        }

        let mut out = Vec::new();
        out.extend_from_slice(&CLASS_MAGIC.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&MAJOR_VERSION.to_be_bytes());
        pool.pool.write(&mut out);
        out.extend_from_slice(&access_flags.to_be_bytes());
        out.extend_from_slice(&this_index.to_be_bytes());
        out.extend_from_slice(&super_index.to_be_bytes());
        out.extend_from_slice(&(interface_indices.len() as u16).to_be_bytes());
        for i in interface_indices {
            out.extend_from_slice(&i.to_be_bytes());
        }
        out.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for f in fields {
            out.extend_from_slice(&f);
        }
        out.extend_from_slice(&(methods.len() as u16).to_be_bytes());
        for m in methods {
            out.extend_from_slice(&m);
        }
        out.extend_from_slice(&class_attributes);
        out
    }
}

fn write_member(pool: &mut PoolWriter, member: &Member, access_flags: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&access_flags.to_be_bytes());
    out.extend_from_slice(&pool.utf8(&member.name).to_be_bytes());
    out.extend_from_slice(&pool.utf8(&member.descriptor).to_be_bytes());
    out.extend_from_slice(&write_annotation_attributes(pool, &member.annotations));
    out
}

/// Attribute table holding at most one `RuntimeVisibleAnnotations` entry.
fn write_annotation_attributes(pool: &mut PoolWriter, annotations: &[Annotation]) -> Vec<u8> {
    let mut out = Vec::new();
    if annotations.is_empty() {
        out.extend_from_slice(&0u16.to_be_bytes());
        return out;
    }

    let mut body = Vec::new();
    body.extend_from_slice(&(annotations.len() as u16).to_be_bytes());
    for a in annotations {
        let descriptor = format!("L{};", internal_name(&a.type_name));
        body.extend_from_slice(&pool.utf8(&descriptor).to_be_bytes());
        let nested = usize::from(a.array_depth > 0);
        body.extend_from_slice(&((a.values.len() + nested) as u16).to_be_bytes());
        for (key, value) in &a.values {
            body.extend_from_slice(&pool.utf8(key).to_be_bytes());
            body.push(b's');
            body.extend_from_slice(&pool.utf8(value).to_be_bytes());
        }
        if a.array_depth > 0 {
            body.extend_from_slice(&pool.utf8("value").to_be_bytes());
            for _ in 0..a.array_depth {
                body.push(b'[');
                body.extend_from_slice(&1u16.to_be_bytes());
            }
            body.push(b'Z');
            body.extend_from_slice(&pool.int(0).to_be_bytes());
        }
    }

    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&pool.utf8("RuntimeVisibleAnnotations").to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

#[derive(Default)]
struct PoolWriter {
    pool: ConstantPool,
    utf8: HashMap<String, u16>,
    classes: HashMap<String, u16>,
}

impl PoolWriter {
    fn utf8(&mut self, s: &str) -> u16 {
        if let Some(i) = self.utf8.get(s) {
            return *i;
        }
        let i = self.pool.push(Constant::Utf8(encode_modified_utf8(s)));
        self.utf8.insert(s.to_string(), i);
        i
    }

    fn int(&mut self, value: u32) -> u16 {
        self.pool.push(Constant::Integer(value))
    }

    fn class(&mut self, binary: &str) -> u16 {
        if let Some(i) = self.classes.get(binary) {
            return *i;
        }
        let name_index = self.utf8(&internal_name(binary));
        let i = self.pool.push(Constant::Class(name_index));
        self.classes.insert(binary.to_string(), i);
        i
    }
}
