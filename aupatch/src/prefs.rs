// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Durable key/value storage for update progress.

use std::{
    collections::BTreeMap,
    fs, io,
    path::PathBuf,
};

use thiserror::Error;
use tracing::debug;

pub const KEY_NEXT_OPERATION: &str = "update-state-next-operation";
pub const KEY_NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";
pub const KEY_SHA256_CONTEXT: &str = "update-state-sha-256-context";
pub const KEY_SIGNED_SHA256_CONTEXT: &str = "update-state-signed-sha-256-context";
pub const KEY_SIGNATURE_BLOB: &str = "update-state-signature-blob";
pub const KEY_MANIFEST_METADATA_SIZE: &str = "manifest-metadata-size";
pub const KEY_UPDATE_CHECK_RESPONSE_HASH: &str = "update-check-response-hash";
pub const KEY_RESUMED_UPDATE_FAILURES: &str = "resumed-update-failures";

/// Every key that makes up the resume state.
pub const UPDATE_STATE_KEYS: &[&str] = &[
    KEY_NEXT_OPERATION,
    KEY_NEXT_DATA_OFFSET,
    KEY_SHA256_CONTEXT,
    KEY_SIGNED_SHA256_CONTEXT,
    KEY_SIGNATURE_BLOB,
    KEY_MANIFEST_METADATA_SIZE,
    KEY_UPDATE_CHECK_RESPONSE_HASH,
    KEY_RESUMED_UPDATE_FAILURES,
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),
    #[error("Value for {key:?} is not an integer: {value:?}")]
    NotAnInteger { key: String, value: String },
    #[error("Value for {0:?} is not valid UTF-8")]
    NotUtf8(String),
    #[error("Failed to access preference: {0:?}")]
    Io(PathBuf, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A simple key/value store. Each key is written independently.
pub trait Prefs {
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn set_string(&mut self, key: &str, value: &str) -> Result<()>;

    fn delete(&mut self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get_string(key)?.is_some())
    }

    /// Integers are stored as decimal strings. Surrounding whitespace is
    /// ignored.
    fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        let Some(value) = self.get_string(key)? else {
            return Ok(None);
        };

        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::NotAnInteger {
                key: key.to_owned(),
                value,
            })
    }

    fn set_i64(&mut self, key: &str, value: i64) -> Result<()> {
        self.set_string(key, &value.to_string())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || !key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(Error::InvalidKey(key.to_owned()));
    }

    Ok(())
}

/// Stores each key as a file in a directory.
#[derive(Debug)]
pub struct FilePrefs {
    dir: PathBuf,
}

impl FilePrefs {
    /// The directory is created on the first write if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

impl Prefs for FilePrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key)?;

        match fs::read(&path) {
            Ok(data) => String::from_utf8(data)
                .map(Some)
                .map_err(|_| Error::NotUtf8(key.to_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(path, e)),
        }
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;

        fs::create_dir_all(&self.dir).map_err(|e| Error::Io(self.dir.clone(), e))?;

        // Write to a temporary file first so that a crash never leaves a
        // truncated value behind.
        let temp_path = self.dir.join(format!(".{key}.tmp"));
        fs::write(&temp_path, value).map_err(|e| Error::Io(temp_path.clone(), e))?;
        fs::rename(&temp_path, &path).map_err(|e| Error::Io(path.clone(), e))?;

        debug!("Set {key} = {value:?}");

        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let path = self.path(key)?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(path, e)),
        }
    }
}

/// Non-persistent store, mostly for tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct MemoryPrefs {
    values: BTreeMap<String, String>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prefs for MemoryPrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.values.get(key).cloned())
    }

    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.values.remove(key);
        Ok(())
    }
}
