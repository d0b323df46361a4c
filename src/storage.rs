//! Key/value storage backends standing in for browser local storage,
//! session storage and the cookie jar.

use crate::errors::{FunnelError, ResultExt};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// String key/value storage with browser `Storage` semantics.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, FunnelError>;
    fn set(&self, key: &str, value: &str) -> Result<(), FunnelError>;
    fn remove(&self, key: &str) -> Result<(), FunnelError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, FunnelError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FunnelError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), FunnelError> {
        (**self).remove(key)
    }
}

/// JSON helpers on top of any [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    /// Reads and decodes a JSON value. Missing keys yield `Ok(None)`.
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FunnelError> {
        match self.get(key)? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("decoding storage key '{}'", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), FunnelError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// In-memory store. With an idle TTL it behaves like session storage:
/// entries vanish once the session has been idle long enough.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Cache<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().max_capacity(10_000).build(),
        }
    }

    pub fn with_idle_timeout(idle: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(10_000)
                .time_to_idle(idle)
                .build(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, FunnelError> {
        Ok(self.entries.get(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FunnelError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), FunnelError> {
        self.entries.invalidate(key);
        Ok(())
    }
}

/// Durable store persisted as a single JSON object on disk.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens the store at `path`, creating it lazily on first write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FunnelError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing storage file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(FunnelError::StorageError(format!(
                    "reading {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        tracing::debug!(
            "Opened file store {} ({} keys)",
            path.display(),
            entries.len()
        );

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), FunnelError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let raw = serde_json::to_string_pretty(entries)?;
        let temp_path = self.temp_path();
        std::fs::write(&temp_path, raw)
            .with_context(|| format!("writing {}", temp_path.display()))?;

        // Atomic replace
        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, FunnelError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FunnelError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), FunnelError> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

/// A first-party cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    /// Decoded value; encoding happens when rendering the header.
    pub value: String,
    pub expires: DateTime<Utc>,
    pub path: String,
    pub same_site: String,
}

impl Cookie {
    pub fn lax(name: impl Into<String>, value: impl Into<String>, expires: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires,
            path: "/".to_string(),
            same_site: "Lax".to_string(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }

    /// Renders the `document.cookie` assignment string.
    pub fn to_header_value(&self) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(self.value.as_bytes()).collect();
        format!(
            "{}={};expires={};path={};SameSite={}",
            self.name,
            encoded,
            self.expires.format("%a, %d %b %Y %H:%M:%S GMT"),
            self.path,
            self.same_site
        )
    }
}

/// Cookie jar abstraction.
pub trait CookieJar: Send + Sync {
    fn set_cookie(&self, cookie: Cookie) -> Result<(), FunnelError>;
    /// Returns the cookie if present and not expired at `now`.
    fn cookie(&self, name: &str, now: DateTime<Utc>) -> Result<Option<Cookie>, FunnelError>;
}

/// Cookie jar persisted through a [`KeyValueStore`].
#[derive(Clone)]
pub struct StoreCookieJar<S> {
    store: S,
}

impl<S: KeyValueStore> StoreCookieJar<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn key(name: &str) -> String {
        format!("cookie:{}", name)
    }
}

impl<S: KeyValueStore> CookieJar for StoreCookieJar<S> {
    fn set_cookie(&self, cookie: Cookie) -> Result<(), FunnelError> {
        self.store.set_json(&Self::key(&cookie.name), &cookie)
    }

    fn cookie(&self, name: &str, now: DateTime<Utc>) -> Result<Option<Cookie>, FunnelError> {
        let key = Self::key(name);
        match self.store.get_json::<Cookie>(&key)? {
            Some(c) if c.is_expired(now) => {
                self.store.remove(&key)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }
}
