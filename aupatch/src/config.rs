// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{bspatch::DEFAULT_BSPATCH_PATH, performer::MAX_RESUMED_UPDATE_FAILURES};

/// Default number of bytes passed to the engine per write.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Chunk size must not be zero")]
    ZeroChunkSize,
}

type Result<T> = std::result::Result<T, Error>;

/// Settings for applying payloads. Every field is optional in the file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub bspatch_path: PathBuf,
    pub prefs_dir: Option<PathBuf>,
    pub public_key: Option<PathBuf>,
    pub hash_checks_mandatory: bool,
    pub enforce_metadata_signature: bool,
    pub max_resumed_update_failures: i64,
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bspatch_path: PathBuf::from(DEFAULT_BSPATCH_PATH),
            prefs_dir: None,
            public_key: None,
            hash_checks_mandatory: false,
            enforce_metadata_signature: false,
            max_resumed_update_failures: MAX_RESUMED_UPDATE_FAILURES,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Config {
    pub fn parse(path: &Path, contents: &str) -> Result<Self> {
        let config: Self =
            toml_edit::de::from_str(contents).map_err(|e| Error::Parse(path.to_owned(), e))?;

        if config.chunk_size == 0 {
            return Err(Error::ZeroChunkSize);
        }

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;

        Self::parse(path, &contents)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse(Path::new("empty.toml"), "").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.bspatch_path, Path::new("bspatch"));
        assert_eq!(config.max_resumed_update_failures, 10);
    }

    #[test]
    fn parse_fields() {
        let config = Config::parse(
            Path::new("config.toml"),
            r#"
                bspatch-path = "/usr/bin/bspatch"
                prefs-dir = "/var/lib/aupatch"
                hash-checks-mandatory = true
                chunk-size = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.bspatch_path, Path::new("/usr/bin/bspatch"));
        assert_eq!(config.prefs_dir.as_deref(), Some(Path::new("/var/lib/aupatch")));
        assert!(config.hash_checks_mandatory);
        assert!(!config.enforce_metadata_signature);
        assert_eq!(config.chunk_size, 4096);
    }

    #[test]
    fn reject_invalid() {
        assert_matches!(
            Config::parse(Path::new("a.toml"), "bspatch = \"x\""),
            Err(Error::Parse(_, _))
        );
        assert_matches!(
            Config::parse(Path::new("b.toml"), "chunk-size = 0"),
            Err(Error::ZeroChunkSize)
        );
    }
}
