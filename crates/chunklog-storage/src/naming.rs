//! Chunk file naming
//!
//! A chunk is identified by `(number, version)`. Version 0 is the chunk as
//! written; each scavenge replacement bumps the version. The default
//! strategy renders both into the name: `chunk-000012.000003`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::StorageError;

/// Suffix of scavenge work files
pub const TEMP_FILE_SUFFIX: &str = ".scavenge.tmp";

/// Maps chunk identities to file paths
pub trait FileNamingStrategy: Send + Sync + fmt::Debug {
    /// Directory holding the chunk files
    fn directory(&self) -> &Path;

    /// Path of a chunk version
    fn filename_for(&self, number: i32, version: i32) -> PathBuf;

    /// Parse `(number, version)` back from a path produced by this strategy
    fn parse(&self, path: &Path) -> Option<(i32, i32)>;

    /// A fresh path for a scavenge work file
    fn temp_filename(&self) -> PathBuf;

    /// Every file in the directory this strategy recognises as a chunk
    fn all_present_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.directory())? {
            let path = entry?.path();
            if self.parse(&path).is_some() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Every version present for a chunk number, highest version first
    fn all_versions_for(&self, number: i32) -> Result<Vec<PathBuf>, StorageError> {
        let mut versions: Vec<(i32, PathBuf)> = self
            .all_present_files()?
            .into_iter()
            .filter_map(|path| match self.parse(&path) {
                Some((n, v)) if n == number => Some((v, path)),
                _ => None,
            })
            .collect();
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(versions.into_iter().map(|(_, path)| path).collect())
    }

    /// Leftover scavenge work files
    fn all_temp_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.directory())? {
            let path = entry?.path();
            let is_temp = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(TEMP_FILE_SUFFIX));
            if is_temp {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// `{prefix}{number:06}.{version:06}` naming
#[derive(Debug, Clone)]
pub struct VersionedPatternFileNamingStrategy {
    directory: PathBuf,
    prefix: String,
}

impl VersionedPatternFileNamingStrategy {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl FileNamingStrategy for VersionedPatternFileNamingStrategy {
    fn directory(&self) -> &Path {
        &self.directory
    }

    fn filename_for(&self, number: i32, version: i32) -> PathBuf {
        self.directory
            .join(format!("{}{:06}.{:06}", self.prefix, number, version))
    }

    fn parse(&self, path: &Path) -> Option<(i32, i32)> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(self.prefix.as_str())?;
        let (number, version) = rest.split_once('.')?;
        if number.len() < 6 || version.len() < 6 {
            return None;
        }
        if !number.bytes().all(|b| b.is_ascii_digit()) || !version.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((number.parse().ok()?, version.parse().ok()?))
    }

    fn temp_filename(&self) -> PathBuf {
        self.directory
            .join(format!("{}{}", Uuid::new_v4(), TEMP_FILE_SUFFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_filename_roundtrip() {
        let naming = VersionedPatternFileNamingStrategy::new("/data", "chunk-");
        let path = naming.filename_for(12, 3);
        assert_eq!(path, PathBuf::from("/data/chunk-000012.000003"));
        assert_eq!(naming.parse(&path), Some((12, 3)));
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        let naming = VersionedPatternFileNamingStrategy::new("/data", "chunk-");
        assert_eq!(naming.parse(Path::new("/data/writer.chk")), None);
        assert_eq!(naming.parse(Path::new("/data/chunk-12.3")), None);
        assert_eq!(naming.parse(Path::new("/data/chunk-000001.00000x")), None);
        assert_eq!(naming.parse(Path::new("/data/other-000001.000000")), None);
    }

    #[test]
    fn test_versions_sorted_descending() {
        let temp = TempDir::new().unwrap();
        let naming = VersionedPatternFileNamingStrategy::new(temp.path(), "chunk-");
        for (n, v) in [(0, 0), (1, 0), (1, 2), (1, 1)] {
            fs::write(naming.filename_for(n, v), b"").unwrap();
        }
        fs::write(temp.path().join("writer.chk"), b"").unwrap();

        let versions = naming.all_versions_for(1).unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(naming.parse(&versions[0]), Some((1, 2)));
        assert_eq!(naming.parse(&versions[2]), Some((1, 0)));
        assert_eq!(naming.all_present_files().unwrap().len(), 4);
    }

    #[test]
    fn test_temp_files_listed() {
        let temp = TempDir::new().unwrap();
        let naming = VersionedPatternFileNamingStrategy::new(temp.path(), "chunk-");
        let tmp = naming.temp_filename();
        fs::write(&tmp, b"").unwrap();
        assert_eq!(naming.all_temp_files().unwrap(), vec![tmp]);
        assert!(naming.all_present_files().unwrap().is_empty());
    }
}
