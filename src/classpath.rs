//! Classpath providers: enumerate class names and hand out raw class bytes.

use anyhow::Context;
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::debug;
use zip::ZipArchive;

use crate::classfile::read_class;
use crate::error::{ProxyError, Result};
use crate::scan::{class_name_to_class_path, class_path_to_class_name, scan_root};

pub trait ClassSource: Send + Sync {
    /// Every class name visible on this classpath snapshot.
    fn class_names(&self) -> &BTreeSet<String>;

    fn read_class(&self, name: &str) -> Result<Vec<u8>>;

    /// Stable digest of the snapshot; changes whenever an entry changes.
    fn fingerprint(&self) -> Result<String>;

    fn contains(&self, name: &str) -> bool {
        self.class_names().contains(name)
    }
}

#[derive(Clone)]
struct SharedMap(Arc<Mmap>);

impl AsRef<[u8]> for SharedMap {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

struct Jar {
    path: PathBuf,
    archive: ZipArchive<Cursor<SharedMap>>,
}

enum Location {
    File(PathBuf),
    Jar { jar: usize, entry: String },
}

/// Jars and class directories on disk.
pub struct Classpath {
    roots: Vec<PathBuf>,
    names: BTreeSet<String>,
    locations: HashMap<String, Location>,
    jars: Vec<Jar>,
    stamps: Vec<(String, u64, u128)>,
}

impl Classpath {
    /// Opens every root in order. The first root that provides a name wins.
    pub fn open(roots: &[PathBuf]) -> anyhow::Result<Self> {
        let mut cp = Self {
            roots: roots.to_vec(),
            names: BTreeSet::new(),
            locations: HashMap::new(),
            jars: Vec::new(),
            stamps: Vec::new(),
        };

        for root in roots {
            if root.is_dir() {
                let listing = scan_root(root)?;
                for file in listing.class_files {
                    let rel = file
                        .strip_prefix(root)
                        .with_context(|| format!("class file outside root: {}", file.display()))?
                        .to_string_lossy()
                        .to_string();
                    if let Some(name) = class_path_to_class_name(&rel) {
                        cp.stamp(&file)?;
                        cp.add(name, Location::File(file));
                    }
                }
                for jar in listing.jars {
                    cp.add_jar(&jar)?;
                }
            } else if root.is_file() {
                cp.add_jar(root)?;
            } else {
                anyhow::bail!("classpath root does not exist: {}", root.display());
            }
        }

        debug!(
            roots = cp.roots.len(),
            jars = cp.jars.len(),
            classes = cp.names.len(),
            "classpath opened"
        );
        Ok(cp)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn add(&mut self, name: String, location: Location) {
        if self.locations.contains_key(&name) {
            return;
        }
        self.names.insert(name.clone());
        self.locations.insert(name, location);
    }

    fn add_jar(&mut self, path: &Path) -> anyhow::Result<()> {
        let file = File::open(path).with_context(|| format!("Failed to open jar: {}", path.display()))?;
        // SAFETY: The file is opened read-only; the map is shared through an Arc
        // and never outlives the archive readers that borrow it.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap jar: {}", path.display()))?;
        let archive = ZipArchive::new(Cursor::new(SharedMap(Arc::new(mmap))))
            .with_context(|| format!("Failed to read zip(jar): {}", path.display()))?;

        let index = self.jars.len();
        let entries: Vec<String> = archive.file_names().map(str::to_string).collect();
        self.stamp(path)?;
        self.jars.push(Jar {
            path: path.to_path_buf(),
            archive,
        });
        for entry in entries {
            if let Some(name) = class_path_to_class_name(&entry) {
                self.add(name, Location::Jar { jar: index, entry });
            }
        }
        Ok(())
    }

    fn stamp(&mut self, path: &Path) -> anyhow::Result<()> {
        let meta = path
            .metadata()
            .with_context(|| format!("Failed to stat: {}", path.display()))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        self.stamps
            .push((path.to_string_lossy().to_string(), meta.len(), mtime));
        Ok(())
    }
}

impl ClassSource for Classpath {
    fn class_names(&self) -> &BTreeSet<String> {
        &self.names
    }

    fn read_class(&self, name: &str) -> Result<Vec<u8>> {
        match self.locations.get(name) {
            None => Err(ProxyError::NotFound(name.to_string())),
            Some(Location::File(path)) => Ok(std::fs::read(path)?),
            Some(Location::Jar { jar, entry }) => {
                let jar = &self.jars[*jar];
                let mut archive = jar.archive.clone();
                let mut file = archive.by_name(entry).map_err(|e| match e {
                    zip::result::ZipError::FileNotFound => ProxyError::NotFound(format!(
                        "{} in {}",
                        class_name_to_class_path(name),
                        jar.path.display()
                    )),
                    other => ProxyError::Zip(other),
                })?;
                let mut buf = Vec::with_capacity(file.size() as usize);
                file.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }

    fn fingerprint(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for (path, len, mtime) in &self.stamps {
            hasher.update(path.as_bytes());
            hasher.update(len.to_be_bytes());
            hasher.update(mtime.to_be_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Class bytes held in memory, keyed by binary name.
#[derive(Debug, Clone, Default)]
pub struct MemoryClasspath {
    names: BTreeSet<String>,
    classes: HashMap<String, Vec<u8>>,
}

impl MemoryClasspath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers bytes under an explicit name; the bytes are not validated.
    pub fn insert(&mut self, name: &str, bytes: Vec<u8>) {
        self.names.insert(name.to_string());
        self.classes.insert(name.to_string(), bytes);
    }

    /// Registers a class under the name found in its own definition.
    pub fn insert_class(&mut self, bytes: Vec<u8>) -> Result<String> {
        let name = read_class(&bytes)
            .map_err(|source| ProxyError::Malformed {
                name: "<memory>".to_string(),
                source,
            })?
            .name;
        self.insert(&name, bytes);
        Ok(name)
    }

    pub fn with_class(mut self, bytes: Vec<u8>) -> Result<Self> {
        self.insert_class(bytes)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl ClassSource for MemoryClasspath {
    fn class_names(&self) -> &BTreeSet<String> {
        &self.names
    }

    fn read_class(&self, name: &str) -> Result<Vec<u8>> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(name.to_string()))
    }

    fn fingerprint(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for name in &self.names {
            hasher.update(name.as_bytes());
            if let Some(bytes) = self.classes.get(name) {
                hasher.update((bytes.len() as u64).to_be_bytes());
                hasher.update(bytes);
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
