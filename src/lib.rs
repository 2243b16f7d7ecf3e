//! # class-proxy
//!
//! Classpath indexing by structural criteria, and version-bound proxy class
//! synthesis driven by that index.
//!
//! ## Architecture
//!
//! - **classfile**: Binary class reader (hierarchy, annotations, constant pool)
//! - **builder**: Minimal class definition writer for in-memory classpaths
//! - **scan** / **classpath**: Classpath roots (directories and jars) as a `ClassSource`
//! - **criterion**: Named structural/annotation predicates, first match wins
//! - **index**: Parallel index build over one classpath snapshot
//! - **cache**: Persistent index store using LMDB (heed), keyed by fingerprint
//! - **registry** / **dispatch**: Category queries, lazy class loading, handler dispatch
//! - **version**: Version tokens and logical-to-concrete name mapping
//! - **ir** / **backend**: Proxy class IR and the constant-pool remapping backend
//! - **generator**: Contract + binding pattern -> synthesized class, cached
//! - **instance**: Singleton instances keyed by contract, pattern and argument types
//! - **session**: One sequential executor per live session key

pub mod backend;
pub mod builder;
pub mod cache;
pub mod classfile;
pub mod classpath;
pub mod cli;
pub mod config;
pub mod criterion;
pub mod dispatch;
pub mod error;
pub mod generator;
pub mod index;
pub mod instance;
pub mod ir;
pub mod registry;
pub mod scan;
pub mod session;
pub mod version;
