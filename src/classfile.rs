//! Binary class reader.
//!
//! Parses the structural metadata of a JVM class definition (hierarchy,
//! annotations on the type and its members, constant-pool class references)
//! straight from its bytes. Nothing is linked or initialized.

use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

pub const CLASS_MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_ANNOTATION: u16 = 0x2000;

const VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
const INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";

/// Deepest nesting of annotation element values (`@` and `[`) accepted.
pub const MAX_ELEMENT_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassFormatError {
    #[error("not a class definition (magic {0:#010x})")]
    BadMagic(u32),

    #[error("truncated at byte {0}")]
    Truncated(usize),

    #[error("invalid constant pool tag {tag} at index {index}")]
    BadTag { index: u16, tag: u8 },

    #[error("constant pool index {0} is out of range or has the wrong kind")]
    BadIndex(u16),

    #[error("invalid modified UTF-8 in constant pool")]
    InvalidUtf8,

    #[error("unknown annotation element tag {0:#04x}")]
    BadElementTag(u8),

    #[error("annotation values nested deeper than {0}")]
    NestingTooDeep(usize),

    #[error("wide constant at index {0} runs past the end of the pool")]
    WideConstantOverflow(u16),
}

type ParseResult<T> = std::result::Result<T, ClassFormatError>;

/// Read-only structural view of one class definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassDescriptor {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub annotations: Vec<String>,
    pub methods: Vec<MemberDescriptor>,
    pub fields: Vec<MemberDescriptor>,
    pub access_flags: u16,
    pub major_version: u16,
    /// Every class named by a `CONSTANT_Class` entry, array element types included.
    pub referenced_classes: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberDescriptor {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub annotations: Vec<String>,
}

impl ClassDescriptor {
    pub fn simple_name(&self) -> &str {
        simple_name(&self.name)
    }

    pub fn package(&self) -> Option<&str> {
        package_name(&self.name)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    /// Name of the enclosing class for nested binary names (`a.Outer$Inner` -> `a.Outer`).
    pub fn outer_name(&self) -> Option<&str> {
        self.name.rsplit_once('$').map(|(outer, _)| outer)
    }
}

pub fn read_class(bytes: &[u8]) -> ParseResult<ClassDescriptor> {
    let raw = RawClass::parse(bytes)?;
    let pool = &raw.pool;
    let mut r = Reader::new(raw.body);

    let access_flags = r.u2()?;
    let name = pool.class_name(r.u2()?)?;
    let super_index = r.u2()?;
    let super_name = if super_index == 0 {
        None
    } else {
        Some(pool.class_name(super_index)?)
    };

    let interface_count = r.u2()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(pool.class_name(r.u2()?)?);
    }

    let fields = read_members(&mut r, pool)?;
    let methods = read_members(&mut r, pool)?;
    let annotations = read_attributes(&mut r, pool)?;

    Ok(ClassDescriptor {
        name,
        super_name,
        interfaces,
        annotations,
        methods,
        fields,
        access_flags,
        major_version: raw.major_version(),
        referenced_classes: pool.referenced_classes()?,
    })
}

fn read_members(r: &mut Reader<'_>, pool: &ConstantPool) -> ParseResult<Vec<MemberDescriptor>> {
    let count = r.u2()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = r.u2()?;
        let name = pool.utf8(r.u2()?)?;
        let descriptor = pool.utf8(r.u2()?)?;
        let annotations = read_attributes(r, pool)?;
        members.push(MemberDescriptor {
            name,
            descriptor,
            access_flags,
            annotations,
        });
    }
    Ok(members)
}

/// Walks an attribute table and returns the annotation type names found in it.
fn read_attributes(r: &mut Reader<'_>, pool: &ConstantPool) -> ParseResult<Vec<String>> {
    let count = r.u2()?;
    let mut annotations = Vec::new();
    for _ in 0..count {
        let name = pool.utf8(r.u2()?)?;
        let len = r.u4()? as usize;
        let body = r.take(len)?;
        if name == VISIBLE_ANNOTATIONS || name == INVISIBLE_ANNOTATIONS {
            let mut inner = Reader::new(body);
            let n = inner.u2()?;
            for _ in 0..n {
                annotations.push(read_annotation(&mut inner, pool, 0)?);
            }
        }
    }
    Ok(annotations)
}

fn read_annotation(r: &mut Reader<'_>, pool: &ConstantPool, depth: usize) -> ParseResult<String> {
    let type_descriptor = pool.utf8(r.u2()?)?;
    let pairs = r.u2()?;
    for _ in 0..pairs {
        r.u2()?;
        skip_element_value(r, pool, depth + 1)?;
    }
    Ok(descriptor_to_binary_name(&type_descriptor).unwrap_or(type_descriptor))
}

fn skip_element_value(r: &mut Reader<'_>, pool: &ConstantPool, depth: usize) -> ParseResult<()> {
    if depth > MAX_ELEMENT_DEPTH {
        return Err(ClassFormatError::NestingTooDeep(MAX_ELEMENT_DEPTH));
    }
    let tag = r.u1()?;
    match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => {
            r.u2()?;
        }
        b'e' => {
            r.u2()?;
            r.u2()?;
        }
        b'@' => {
            read_annotation(r, pool, depth)?;
        }
        b'[' => {
            let n = r.u2()?;
            for _ in 0..n {
                skip_element_value(r, pool, depth + 1)?;
            }
        }
        other => return Err(ClassFormatError::BadElementTag(other)),
    }
    Ok(())
}

/// `a/b/C$D` -> `a.b.C$D`
pub fn binary_name(internal: &str) -> String {
    internal.replace('/', ".")
}

/// `a.b.C$D` -> `a/b/C$D`
pub fn internal_name(binary: &str) -> String {
    binary.replace('.', "/")
}

pub fn simple_name(binary: &str) -> &str {
    binary.rsplit_once('.').map_or(binary, |(_, simple)| simple)
}

pub fn package_name(binary: &str) -> Option<&str> {
    binary.rsplit_once('.').map(|(pkg, _)| pkg)
}

/// `Lcom/x/A;` -> `com.x.A`; anything else yields `None`.
pub fn descriptor_to_binary_name(descriptor: &str) -> Option<String> {
    descriptor
        .strip_prefix('L')
        .and_then(|d| d.strip_suffix(';'))
        .map(binary_name)
}

/// Resolves the raw name of a `CONSTANT_Class` entry. Arrays yield their
/// element class; primitive arrays yield `None`.
fn class_ref_name(raw: &str) -> Option<String> {
    if raw.starts_with('[') {
        descriptor_to_binary_name(raw.trim_start_matches('['))
    } else {
        Some(binary_name(raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Constant {
    /// Slot 0 and the upper half of long/double entries.
    Unusable,
    Utf8(Vec<u8>),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
}

impl Constant {
    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Constant::Unusable => {}
            Constant::Utf8(bytes) => {
                out.push(1);
                put_u2(out, bytes.len() as u16);
                out.extend_from_slice(bytes);
            }
            Constant::Integer(v) => {
                out.push(3);
                put_u4(out, *v);
            }
            Constant::Float(v) => {
                out.push(4);
                put_u4(out, *v);
            }
            Constant::Long(v) => {
                out.push(5);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Constant::Double(v) => {
                out.push(6);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Constant::Class(i) => write_tagged_u2(out, 7, *i),
            Constant::String(i) => write_tagged_u2(out, 8, *i),
            Constant::FieldRef(a, b) => write_tagged_pair(out, 9, *a, *b),
            Constant::MethodRef(a, b) => write_tagged_pair(out, 10, *a, *b),
            Constant::InterfaceMethodRef(a, b) => write_tagged_pair(out, 11, *a, *b),
            Constant::NameAndType(a, b) => write_tagged_pair(out, 12, *a, *b),
            Constant::MethodHandle(kind, i) => {
                out.push(15);
                out.push(*kind);
                put_u2(out, *i);
            }
            Constant::MethodType(i) => write_tagged_u2(out, 16, *i),
            Constant::Dynamic(a, b) => write_tagged_pair(out, 17, *a, *b),
            Constant::InvokeDynamic(a, b) => write_tagged_pair(out, 18, *a, *b),
            Constant::Module(i) => write_tagged_u2(out, 19, *i),
            Constant::Package(i) => write_tagged_u2(out, 20, *i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }
}

impl ConstantPool {
    fn parse(r: &mut Reader<'_>) -> ParseResult<Self> {
        let count = u32::from(r.u2()?);
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);

        // Slots are counted in u32; a wide entry in the last slot would overflow u16.
        let mut index = 1u32;
        while index < count {
            let slot = index as u16;
            let tag = r.u1()?;
            let constant = match tag {
                1 => {
                    let len = r.u2()? as usize;
                    Constant::Utf8(r.take(len)?.to_vec())
                }
                3 => Constant::Integer(r.u4()?),
                4 => Constant::Float(r.u4()?),
                5 => Constant::Long(r.u8()?),
                6 => Constant::Double(r.u8()?),
                7 => Constant::Class(r.u2()?),
                8 => Constant::String(r.u2()?),
                9 => Constant::FieldRef(r.u2()?, r.u2()?),
                10 => Constant::MethodRef(r.u2()?, r.u2()?),
                11 => Constant::InterfaceMethodRef(r.u2()?, r.u2()?),
                12 => Constant::NameAndType(r.u2()?, r.u2()?),
                15 => Constant::MethodHandle(r.u1()?, r.u2()?),
                16 => Constant::MethodType(r.u2()?),
                17 => Constant::Dynamic(r.u2()?, r.u2()?),
                18 => Constant::InvokeDynamic(r.u2()?, r.u2()?),
                19 => Constant::Module(r.u2()?),
                20 => Constant::Package(r.u2()?),
                tag => return Err(ClassFormatError::BadTag { index: slot, tag }),
            };
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            if wide && index + 1 >= count {
                return Err(ClassFormatError::WideConstantOverflow(slot));
            }
            entries.push(constant);
            index += 1;
            if wide {
                entries.push(Constant::Unusable);
                index += 1;
            }
        }

        Ok(Self { entries })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, index: u16) -> Option<&Constant> {
        self.entries.get(index as usize)
    }

    pub(crate) fn push(&mut self, constant: Constant) -> u16 {
        let index = self.entries.len() as u16;
        let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        index
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Constant> {
        self.entries.iter_mut()
    }

    /// Every UTF-8 entry, decoded. Descriptors and signatures used by call
    /// sites, method types and attributes live only here.
    pub(crate) fn utf8_texts(&self) -> ParseResult<Vec<String>> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                Constant::Utf8(bytes) => Some(decode_modified_utf8(bytes)),
                _ => None,
            })
            .collect()
    }

    /// Indices of the UTF-8 entries that hold `CONSTANT_Class` names.
    pub(crate) fn class_name_slots(&self) -> BTreeSet<usize> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                Constant::Class(name_index) => Some(*name_index as usize),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn utf8(&self, index: u16) -> ParseResult<String> {
        match self.get(index) {
            Some(Constant::Utf8(bytes)) => decode_modified_utf8(bytes),
            _ => Err(ClassFormatError::BadIndex(index)),
        }
    }

    fn class_name(&self, index: u16) -> ParseResult<String> {
        match self.get(index) {
            Some(Constant::Class(name_index)) => Ok(binary_name(&self.utf8(*name_index)?)),
            _ => Err(ClassFormatError::BadIndex(index)),
        }
    }

    fn referenced_classes(&self) -> ParseResult<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for entry in &self.entries {
            if let Constant::Class(name_index) = entry
                && let Some(name) = class_ref_name(&self.utf8(*name_index)?)
            {
                names.insert(name);
            }
        }
        Ok(names)
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        put_u2(out, self.entries.len() as u16);
        for entry in self.entries.iter().skip(1) {
            entry.write(out);
        }
    }
}

/// A class split into its header, constant pool, and everything after the
/// pool. Constant indices stay stable across a rewrite, so `body` can be
/// copied verbatim.
pub(crate) struct RawClass<'a> {
    header: &'a [u8],
    pub(crate) pool: ConstantPool,
    pub(crate) body: &'a [u8],
}

impl<'a> RawClass<'a> {
    pub(crate) fn parse(bytes: &'a [u8]) -> ParseResult<Self> {
        let mut r = Reader::new(bytes);
        let magic = r.u4()?;
        if magic != CLASS_MAGIC {
            return Err(ClassFormatError::BadMagic(magic));
        }
        r.u2()?;
        r.u2()?;
        let header = &bytes[..8];
        let pool = ConstantPool::parse(&mut r)?;
        Ok(Self {
            header,
            pool,
            body: &bytes[r.pos..],
        })
    }

    fn major_version(&self) -> u16 {
        u16::from_be_bytes([self.header[6], self.header[7]])
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + self.body.len() + 256);
        out.extend_from_slice(self.header);
        self.pool.write(&mut out);
        out.extend_from_slice(self.body);
        out
    }
}

pub(crate) fn decode_modified_utf8(bytes: &[u8]) -> ParseResult<String> {
    if let Ok(s) = std::str::from_utf8(bytes)
        && !s.contains('\u{0}')
    {
        return Ok(s.to_string());
    }

    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let cont = |j: usize| -> ParseResult<u16> {
            match bytes.get(j) {
                Some(c) if c & 0xC0 == 0x80 => Ok((c & 0x3F) as u16),
                _ => Err(ClassFormatError::InvalidUtf8),
            }
        };
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            units.push((((b & 0x1F) as u16) << 6) | cont(i + 1)?);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            units.push((((b & 0x0F) as u16) << 12) | (cont(i + 1)? << 6) | cont(i + 2)?);
            i += 3;
        } else {
            return Err(ClassFormatError::InvalidUtf8);
        }
    }
    String::from_utf16(&units).map_err(|_| ClassFormatError::InvalidUtf8)
}

pub(crate) fn encode_modified_utf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

fn put_u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn write_tagged_u2(out: &mut Vec<u8>, tag: u8, v: u16) {
    out.push(tag);
    put_u2(out, v);
}

fn write_tagged_pair(out: &mut Vec<u8>, tag: u8, a: u16, b: u16) {
    out.push(tag);
    put_u2(out, a);
    put_u2(out, b);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> ParseResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(ClassFormatError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u1(&mut self) -> ParseResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u2(&mut self) -> ParseResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u4(&mut self) -> ParseResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u8(&mut self) -> ParseResult<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }
}
