use super::{CacheKey, ResultCache};
use crate::error::CacheError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One JSON file per key under a directory. Writes go through a unique temp
/// file and a rename, so concurrent writers of the same key never leave a
/// torn entry behind.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }
}

impl ResultCache for DiskCache {
    fn exists(&self, key: &CacheKey) -> bool {
        self.entry_path(key).is_file()
    }

    fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.entry_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, key: &CacheKey, value: &[u8]) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let tmp = self
            .dir
            .join(format!("{}.{}.tmp", key.as_str(), Uuid::new_v4().simple()));
        fs::write(&tmp, value)?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
