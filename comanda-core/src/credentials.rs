//! Persisted session credentials.
//!
//! Credentials live under one key as JSON. Devices that logged in with an
//! older build have three loose keys instead; those are migrated the first
//! time they are read.
//!
//! ## Layout
//!
//! ```text
//! @app/user        {"username", "cargo", "carrinho", "token", "expiresAt"}
//! username         legacy
//! userToken        legacy
//! senhaExpiration  legacy, expiry in epoch milliseconds
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::RequestContext;
use crate::task::lock;

const USER_KEY: &str = "@app/user";
const LEGACY_USERNAME_KEY: &str = "username";
const LEGACY_TOKEN_KEY: &str = "userToken";
const LEGACY_EXPIRY_KEY: &str = "senhaExpiration";

/// A logged-in staff member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(rename = "cargo", default)]
    pub role: String,
    #[serde(rename = "carrinho", default)]
    pub workspace: String,
    #[serde(default)]
    pub token: String,
    #[serde(
        rename = "expiresAt",
        default,
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            role: String::new(),
            workspace: String::new(),
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// No expiry means the session never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before the session expires, if it expires at all.
    pub fn expires_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        let at = self.expires_at?;
        Some((at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Context attached to every request made as this user.
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.workspace.clone())
            .with_actor(self.username.clone(), self.token.clone())
            .with_role(self.role.clone())
    }
}

/// Minimal string key-value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// One file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// File backing `key`. Characters unsafe in file names become `_`.
    pub fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(name)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::IoError(path, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).map_err(|e| StorageError::IoError(self.dir.clone(), e))?;
        let path = self.path(key);
        fs::write(&path, value).map_err(|e| StorageError::IoError(path, e))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::IoError(path, e)),
        }
    }
}

/// In-memory store, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// Errors from credential persistence.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error reading or writing a file.
    IoError(PathBuf, io::Error),
    /// Credentials could not be encoded.
    EncodeError(String),
    /// Credentials are missing a username or token.
    Invalid(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::IoError(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
            StorageError::EncodeError(e) => write!(f, "Failed to encode credentials: {}", e),
            StorageError::Invalid(msg) => write!(f, "Invalid credentials: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::IoError(_, e) => Some(e),
            _ => None,
        }
    }
}

/// Reads and writes [`Credentials`] through a [`KeyValueStore`].
#[derive(Debug)]
pub struct CredentialStore<S> {
    store: S,
}

impl<S: KeyValueStore> CredentialStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// The saved session, if one exists and has not expired.
    ///
    /// Never fails: unreadable storage reads as logged out.
    pub fn load(&self) -> Option<Credentials> {
        self.load_at(Utc::now())
    }

    fn load_at(&self, now: DateTime<Utc>) -> Option<Credentials> {
        if let Some(credentials) = self.read_current() {
            if credentials.is_expired_at(now) {
                tracing::info!(user = %credentials.username, "saved session expired");
                return None;
            }
            return Some(credentials);
        }

        let legacy = self.read_legacy()?;
        if legacy.is_expired_at(now) {
            tracing::info!(user = %legacy.username, "legacy session expired");
            return None;
        }
        tracing::info!(user = %legacy.username, "migrating legacy session");
        if let Err(e) = self.write(&legacy) {
            tracing::warn!("could not migrate legacy session: {}", e);
        }
        Some(legacy)
    }

    /// Saves a new session. Username and token are required.
    pub fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        if credentials.username.trim().is_empty() {
            return Err(StorageError::Invalid("username is empty".to_string()));
        }
        if credentials.token.trim().is_empty() {
            return Err(StorageError::Invalid("token is empty".to_string()));
        }
        self.write(credentials)
    }

    /// Forgets the session, including any legacy keys.
    pub fn clear(&self) -> Result<(), StorageError> {
        for key in [
            USER_KEY,
            LEGACY_USERNAME_KEY,
            LEGACY_TOKEN_KEY,
            LEGACY_EXPIRY_KEY,
        ] {
            self.store.remove(key)?;
        }
        Ok(())
    }

    /// Request context for the saved session.
    pub fn context(&self) -> Option<RequestContext> {
        self.load().map(|c| c.context())
    }

    fn write(&self, credentials: &Credentials) -> Result<(), StorageError> {
        let json = serde_json::to_string(credentials)
            .map_err(|e| StorageError::EncodeError(e.to_string()))?;
        self.store.set(USER_KEY, &json)
    }

    fn read_current(&self) -> Option<Credentials> {
        let raw = self.get_quietly(USER_KEY)?;
        match serde_json::from_str::<Credentials>(&raw) {
            Ok(c) if !c.token.is_empty() => Some(c),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("ignoring unreadable saved session: {}", e);
                None
            }
        }
    }

    fn read_legacy(&self) -> Option<Credentials> {
        let username = self.get_quietly(LEGACY_USERNAME_KEY)?;
        let token = self.get_quietly(LEGACY_TOKEN_KEY)?;
        if username.is_empty() || token.is_empty() {
            return None;
        }
        let expires_at = self
            .get_quietly(LEGACY_EXPIRY_KEY)
            .and_then(|ms| ms.trim().parse::<i64>().ok())
            .filter(|ms| *ms > 0)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Some(Credentials {
            expires_at,
            ..Credentials::new(username, token)
        })
    }

    fn get_quietly(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, "credential storage read failed: {}", e);
                None
            }
        }
    }
}
