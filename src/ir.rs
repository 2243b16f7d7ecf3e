//! Intermediate form of a class about to be synthesized.
//!
//! Lowering reads the target's structure and works out, through the version
//! resolver, which class references must be renamed on this host. Backends
//! compile the result; they never consult the resolver themselves.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::classfile::{
    ClassFormatError, MemberDescriptor, RawClass, binary_name, internal_name, read_class,
};
use crate::version::VersionResolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberIr {
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyClassIr {
    /// Binary name the class is defined under.
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<MemberIr>,
    pub methods: Vec<MemberIr>,
    /// Internal names, original -> host.
    pub relocations: BTreeMap<String, String>,
    #[serde(skip)]
    pub source: Vec<u8>,
    pub nested: Vec<ProxyClassIr>,
}

impl ProxyClassIr {
    /// Builds the IR for one class definition. Super type, interfaces and
    /// member descriptors are recorded as they will read after relocation.
    ///
    /// Relocation candidates are every class the constant pool names: class
    /// entries plus each `L...;` type inside any UTF-8 entry, which covers
    /// member and call-site descriptors, method types, annotation types and
    /// generic signatures.
    pub fn lower(source: Vec<u8>, resolver: &dyn VersionResolver) -> Result<Self, ClassFormatError> {
        let class = read_class(&source)?;

        let mut candidates: BTreeSet<String> = class.referenced_classes.clone();
        for text in RawClass::parse(&source)?.pool.utf8_texts()? {
            candidates.extend(descriptor_classes(&text));
        }
        candidates.remove(&class.name);

        let relocations: BTreeMap<String, String> = candidates
            .iter()
            .filter_map(|name| {
                resolver
                    .map_name(name)
                    .filter(|mapped| mapped != name)
                    .map(|mapped| (internal_name(name), internal_name(&mapped)))
            })
            .collect();

        let relocate = |name: &String| relocate_binary(name, &relocations);
        let lower_members = |members: &[MemberDescriptor]| -> Vec<MemberIr> {
            members
                .iter()
                .map(|m| MemberIr {
                    name: m.name.clone(),
                    descriptor: remap_descriptor(&m.descriptor, &relocations)
                        .unwrap_or_else(|| m.descriptor.clone()),
                })
                .collect()
        };

        Ok(Self {
            super_name: class.super_name.as_ref().map(relocate),
            interfaces: class.interfaces.iter().map(relocate).collect(),
            fields: lower_members(&class.fields),
            methods: lower_members(&class.methods),
            name: class.name,
            relocations,
            source,
            nested: Vec::new(),
        })
    }

    pub fn with_nested(mut self, nested: Vec<ProxyClassIr>) -> Self {
        self.nested = nested;
        self
    }

    /// This class plus everything nested under it.
    pub fn class_count(&self) -> usize {
        1 + self.nested.iter().map(ProxyClassIr::class_count).sum::<usize>()
    }
}

fn relocate_binary(name: &str, relocations: &BTreeMap<String, String>) -> String {
    relocations
        .get(&internal_name(name))
        .map_or_else(|| name.to_string(), |to| binary_name(to))
}

/// Binary names of every `L<name>;` or `L<name><` type in a descriptor or
/// generic signature. Tokenizes exactly as [`remap_descriptor`] does.
fn descriptor_classes(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('L') {
        let tail = &rest[start + 1..];
        let Some(end) = tail.find([';', '<']) else {
            break;
        };
        if end > 0 {
            names.push(binary_name(&tail[..end]));
        }
        rest = &tail[end..];
    }
    names
}

/// Rewrites `L<name>;` and `L<name><` occurrences whose internal name is
/// relocated. Returns `None` when nothing changed.
pub(crate) fn remap_descriptor(text: &str, relocations: &BTreeMap<String, String>) -> Option<String> {
    if relocations.is_empty() || !text.contains('L') {
        return None;
    }
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len() + 16);
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'L'
            && let Some(len) = text[i + 1..].find([';', '<'])
        {
            let end = i + 1 + len;
            if let Some(to) = relocations.get(&text[i + 1..end]) {
                out.push_str(&text[copied..=i]);
                out.push_str(to);
                copied = end;
            }
            i = end;
        } else {
            i += 1;
        }
    }
    if copied == 0 {
        return None;
    }
    out.push_str(&text[copied..]);
    Some(out)
}
