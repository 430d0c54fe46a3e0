//! Durable JSON document store.
//!
//! Documents are addressed by relative `/`-separated keys resolved against a
//! root directory. Every read takes a shared advisory lock and every write an
//! exclusive one, both on a sidecar `<file>.lock`. Writes go through a sibling
//! temp file that is fsynced and renamed over the destination, so a reader
//! sees either the old document or the new one, never a torn write.

use cogloop_core::events::SharedSink;
use cogloop_core::{Event, TracingSink};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {key}")]
    NotFound { key: String },
    #[error("failed to parse document {key}: {source}")]
    ParseError {
        key: String,
        source: serde_json::Error,
    },
    #[error("document {key} is not {expected}")]
    TypeMismatch { key: String, expected: &'static str },
    #[error("document {key} does not match schema: {source}")]
    Schema {
        key: String,
        source: serde_json::Error,
    },
    #[error("invalid store key: {0:?}")]
    InvalidKey(String),
    #[error("store I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Suffix of sidecar lock files, reserved out of the key space.
const LOCK_SUFFIX: &str = ".lock";

/// Advisory lock on a document's sidecar file. Released on drop.
struct DocumentLock {
    file: File,
}

impl DocumentLock {
    fn lock_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(LOCK_SUFFIX);
        path.with_file_name(name)
    }

    fn open(path: &Path) -> Result<File> {
        let lock_path = Self::lock_path(path);
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_error(&lock_path))
    }

    fn shared(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        FileExt::lock_shared(&file).map_err(io_error(path))?;
        Ok(Self { file })
    }

    fn exclusive(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        FileExt::lock_exclusive(&file).map_err(io_error(path))?;
        Ok(Self { file })
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(error = %err, "failed to release document lock");
        }
    }
}

/// File-backed JSON document store.
#[derive(Debug, Clone)]
pub struct DurableStore {
    root: PathBuf,
    sink: SharedSink,
}

impl DurableStore {
    pub fn new(root: impl Into<PathBuf>, sink: SharedSink) -> Self {
        Self {
            root: root.into(),
            sink,
        }
    }

    /// Store that reports saves through `tracing`.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::new(root, TracingSink::shared())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to its file path.
    ///
    /// Keys must be relative and made of plain components only. Names ending
    /// in `.lock` belong to the sidecar lock files and are refused.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with('/')
            && !key.ends_with(LOCK_SUFFIX)
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Load a document.
    ///
    /// A missing document returns `default` or `NotFound`. An unparseable
    /// document returns `default` (with a warning) or `ParseError`.
    pub fn load(&self, key: &str, default: Option<Value>) -> Result<Value> {
        let path = self.path_for(key)?;
        let parent_exists = path.parent().is_some_and(Path::exists);
        if !parent_exists {
            return default.ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            });
        }

        let _lock = DocumentLock::shared(&path)?;
        Self::read_locked(key, &path, default)
    }

    fn read_locked(key: &str, path: &Path, default: Option<Value>) -> Result<Value> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return default.ok_or_else(|| StoreError::NotFound {
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(io_error(path)(err)),
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(source) => match default {
                Some(default) => {
                    warn!(key, error = %source, "unparseable document; using default");
                    Ok(default)
                }
                None => Err(StoreError::ParseError {
                    key: key.to_string(),
                    source,
                }),
            },
        }
    }

    /// Atomically replace a document. Parent directories are created.
    pub fn save(&self, key: &str, document: &Value) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = Self::ensure_parent(&path)?;
        let _lock = DocumentLock::exclusive(&path)?;
        self.write_locked(key, &path, parent, document)
    }

    fn ensure_parent(path: &Path) -> Result<&Path> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
        fs::create_dir_all(parent).map_err(io_error(parent))?;
        Ok(parent)
    }

    fn write_locked(&self, key: &str, path: &Path, parent: &Path, document: &Value) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document).map_err(|source| StoreError::Schema {
            key: key.to_string(),
            source,
        })?;

        // Dropping the temp file on any error below removes it.
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_error(parent))?;
        tmp.write_all(&bytes).map_err(io_error(tmp.path()))?;
        tmp.as_file().sync_all().map_err(io_error(path))?;
        tmp.persist(path).map_err(|err| io_error(path)(err.error))?;

        match File::open(parent) {
            Ok(dir) => {
                if let Err(err) = dir.sync_all() {
                    debug!(path = %parent.display(), error = %err, "directory fsync failed");
                }
            }
            Err(err) => debug!(path = %parent.display(), error = %err, "directory open failed"),
        }

        self.sink.emit(Event::DocumentSaved {
            key: key.to_string(),
            bytes: bytes.len(),
        });
        Ok(())
    }

    /// Push an entry onto an array document, creating it if absent.
    pub fn append(&self, key: &str, entry: Value) -> Result<()> {
        let mut document = self.load(key, Some(Value::Array(Vec::new())))?;
        let Value::Array(entries) = &mut document else {
            return Err(StoreError::TypeMismatch {
                key: key.to_string(),
                expected: "an array",
            });
        };
        entries.push(entry);
        self.save(key, &document)
    }

    /// Set one field of an object document, creating it if absent.
    pub fn update(&self, key: &str, field: &str, value: Value) -> Result<()> {
        let mut document = self.load(key, Some(Value::Object(serde_json::Map::new())))?;
        let Value::Object(fields) = &mut document else {
            return Err(StoreError::TypeMismatch {
                key: key.to_string(),
                expected: "an object",
            });
        };
        fields.insert(field.to_string(), value);
        self.save(key, &document)
    }

    /// Load a document and check it against `T`.
    pub fn load_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.load(key, None)?;
        Self::decode(key, value)
    }

    /// Load a document as `T`, or `T::default()` when it does not exist.
    pub fn load_as_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.load_as(key) {
            Err(err) if err.is_not_found() => Ok(T::default()),
            other => other,
        }
    }

    pub fn save_as<T: Serialize>(&self, key: &str, document: &T) -> Result<()> {
        let value = Self::encode(key, document)?;
        self.save(key, &value)
    }

    pub fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|source| StoreError::Schema {
            key: key.to_string(),
            source,
        })
    }

    pub fn encode<T: Serialize>(key: &str, document: &T) -> Result<Value> {
        serde_json::to_value(document).map_err(|source| StoreError::Schema {
            key: key.to_string(),
            source,
        })
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    /// Delete a document. Returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        if !path.parent().is_some_and(Path::exists) {
            return Ok(false);
        }
        let _lock = DocumentLock::exclusive(&path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&path)(err)),
        }
    }

    /// Read-modify-write with the exclusive lock held throughout.
    ///
    /// `f` sees the current document (or `default`). The document is saved
    /// only when `f` succeeds.
    pub fn modify<R>(
        &self,
        key: &str,
        default: Value,
        f: impl FnOnce(&mut Value) -> Result<R>,
    ) -> Result<R> {
        let path = self.path_for(key)?;
        let parent = Self::ensure_parent(&path)?;
        let _lock = DocumentLock::exclusive(&path)?;

        let mut document = Self::read_locked(key, &path, Some(default))?;
        let result = f(&mut document)?;
        self.write_locked(key, &path, parent, &document)?;
        Ok(result)
    }
}
