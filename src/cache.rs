//! Persistent store of rendered diagrams.
//!
//! Entries are keyed by a [`CacheKey`] derived from the diagram source and
//! the canonical option list, so a hit always means an identical render.
//! Nothing is ever evicted; stale entries simply stop being looked up.
//!
//! [`FileStore`] keeps everything in one database file:
//!
//! ```text
//! {cache-dir}/
//! +-- d2-cache.json      # {"<hex key>": "<base64 svg>", ...}
//! ```
//!
//! The file is read once when the store is opened and written back once on
//! [`CacheStore::close`], and only if something was added.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::options::RenderOptions;

/// Name of the database file inside the cache directory
pub const DATABASE_FILE: &str = "d2-cache.json";

/// Bumped whenever the on-disk layout or the key derivation changes
const DATABASE_VERSION: u32 = 1;

/// Where the diagram source comes from
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    /// Source text embedded in a chapter
    Inline(&'a [u8]),
    /// A `.d2` file, identified by path and modification time
    File {
        /// Canonical path of the file
        path: &'a Path,
        /// `None` when the platform cannot report it
        modified: Option<SystemTime>,
    },
}

/// SHA-256 digest identifying one (source, options) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Hashes the source identity followed by the canonical option list
    ///
    /// Every part is length-prefixed so that no two different inputs can
    /// concatenate to the same byte stream.
    pub fn new(source: Source<'_>, options: &RenderOptions) -> Self {
        let mut hasher = Sha256::new();
        match source {
            Source::Inline(bytes) => {
                hasher.update(b"inline");
                update_prefixed(&mut hasher, bytes);
            }
            Source::File { path, modified } => {
                hasher.update(b"file");
                update_prefixed(&mut hasher, path.to_string_lossy().as_bytes());
                let nanos = modified
                    .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());
                hasher.update(nanos.to_le_bytes());
            }
        }
        for arg in options.to_args() {
            update_prefixed(&mut hasher, arg.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        bytes.try_into().ok().map(Self)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Errors raised while opening or flushing a [`FileStore`]
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cache directory could not be created
    #[error("failed to create cache directory {path}: {source}")]
    CreateDir {
        /// Directory that was being created
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// The database could not be written back
    #[error("failed to write cache database {path}: {source}")]
    Write {
        /// Database file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// The entries could not be serialized
    #[error("failed to encode cache database: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key-value store for successful d2 output
///
/// Only ever populated with successful renders.
pub trait CacheStore {
    /// Looks up a previously stored render
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>>;

    /// Records a successful render
    fn put(&mut self, key: CacheKey, value: Vec<u8>);

    /// Flushes and releases the backing storage
    fn close(&mut self) -> Result<(), CacheError>;
}

/// [`CacheStore`] used when caching is disabled; always misses
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl CacheStore for NullStore {
    fn get(&self, _key: &CacheKey) -> Option<Vec<u8>> {
        None
    }

    fn put(&mut self, _key: CacheKey, _value: Vec<u8>) {}

    fn close(&mut self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct Database {
    version: u32,
    entries: BTreeMap<String, String>,
}

/// Single-file [`CacheStore`] living in the configured cache directory
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<CacheKey, Vec<u8>>,
    dirty: bool,
    closed: bool,
}

impl FileStore {
    /// Opens the database in `dir`, creating the directory if missing
    ///
    /// An unreadable, corrupt or outdated database is logged and replaced
    /// by an empty one; only failing to create the directory is an error.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(dir).map_err(|source| CacheError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(DATABASE_FILE);
        let entries = load(&path);
        debug!("Opened d2 cache {} ({} entries)", path.display(), entries.len());

        Ok(Self {
            path,
            entries,
            dirty: false,
            closed: false,
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored renders
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been stored yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn flush(&self) -> Result<(), CacheError> {
        let database = Database {
            version: DATABASE_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.to_string(), STANDARD.encode(v)))
                .collect(),
        };
        let json = serde_json::to_vec(&database)?;

        // write a sibling file, then rename it over the database
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|source| CacheError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

fn load(path: &Path) -> BTreeMap<CacheKey, Vec<u8>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!("Unable to read d2 cache {}: {e}", path.display());
            return BTreeMap::new();
        }
    };
    let database: Database = match serde_json::from_slice(&bytes) {
        Ok(database) => database,
        Err(e) => {
            warn!("Ignoring corrupt d2 cache {}: {e}", path.display());
            return BTreeMap::new();
        }
    };
    if database.version != DATABASE_VERSION {
        debug!(
            "d2 cache version mismatch (stored={}, current={DATABASE_VERSION}), starting empty",
            database.version
        );
        return BTreeMap::new();
    }

    database
        .entries
        .into_iter()
        .filter_map(|(k, v)| Some((CacheKey::from_hex(&k)?, STANDARD.decode(v).ok()?)))
        .collect()
}

impl CacheStore for FileStore {
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: CacheKey, value: Vec<u8>) {
        self.entries.insert(key, value);
        self.dirty = true;
    }

    fn close(&mut self) -> Result<(), CacheError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.dirty {
            self.flush()?;
            self.dirty = false;
            debug!("Wrote d2 cache {} ({} entries)", self.path.display(), self.entries.len());
        }
        Ok(())
    }
}
