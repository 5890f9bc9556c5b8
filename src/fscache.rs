//! A memoizing view of the file system.
//!
//! All stat, read and digest operations performed by the orchestrator go
//! through this cache so that a file is inspected at most once per build, and
//! so that the cache validator and the parser observe the same snapshot of a
//! source file even if it changes on disk mid-build.

use crate::{error::IoError, utils};
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

/// The subset of `fs::Metadata` the orchestrator cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    /// Modification time in whole seconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    pub is_file: bool,
    pub is_dir: bool,
}

impl FileStat {
    fn from_metadata(meta: &fs::Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Self { mtime, size: meta.len(), is_file: meta.is_file(), is_dir: meta.is_dir() }
    }
}

/// Memoizes stat/read/digest results per path for the duration of one build.
#[derive(Debug, Default)]
pub struct FileSystemCache {
    stats: HashMap<PathBuf, Option<FileStat>>,
    contents: HashMap<PathBuf, String>,
    hashes: HashMap<PathBuf, String>,
}

impl FileSystemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stat `path`, memoizing the result. Failures are memoized as misses.
    pub fn stat(&mut self, path: &Path) -> Result<FileStat, IoError> {
        if let Some(cached) = self.stats.get(path) {
            return cached.ok_or_else(|| {
                IoError::new(io::Error::new(io::ErrorKind::NotFound, "stat failed"), path)
            });
        }
        let stat = fs::metadata(path).map(|meta| FileStat::from_metadata(&meta));
        self.stats.insert(path.to_path_buf(), stat.as_ref().ok().copied());
        stat.map_err(|err| IoError::new(err, path))
    }

    pub fn is_file(&mut self, path: &Path) -> bool {
        self.stat(path).map(|st| st.is_file).unwrap_or(false)
    }

    pub fn is_dir(&mut self, path: &Path) -> bool {
        self.stat(path).map(|st| st.is_dir).unwrap_or(false)
    }

    /// Read `path` as UTF-8, memoizing contents and digest.
    pub fn read(&mut self, path: &Path) -> Result<String, IoError> {
        if let Some(contents) = self.contents.get(path) {
            return Ok(contents.clone());
        }
        let contents = fs::read_to_string(path).map_err(|err| IoError::new(err, path))?;
        self.hashes.insert(path.to_path_buf(), utils::compute_hash(&contents));
        self.contents.insert(path.to_path_buf(), contents.clone());
        Ok(contents)
    }

    /// The source digest of `path`, reading the file if necessary.
    pub fn md5(&mut self, path: &Path) -> Result<String, IoError> {
        if let Some(hash) = self.hashes.get(path) {
            return Ok(hash.clone());
        }
        self.read(path)?;
        Ok(self.hashes[path].clone())
    }

    /// Drop all memoized state, forcing the next access to hit the disk.
    pub fn flush(&mut self) {
        self.stats.clear();
        self.contents.clear();
        self.hashes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memoizes_reads_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("m.py");
        fs::write(&file, "import a\n").unwrap();

        let mut cache = FileSystemCache::new();
        let first = cache.read(&file).unwrap();
        let hash = cache.md5(&file).unwrap();

        // The cached view survives the file changing underneath us.
        let mut f = fs::OpenOptions::new().write(true).open(&file).unwrap();
        f.write_all(b"import b\n").unwrap();
        drop(f);

        assert_eq!(cache.read(&file).unwrap(), first);
        assert_eq!(cache.md5(&file).unwrap(), hash);

        cache.flush();
        assert_ne!(cache.md5(&file).unwrap(), hash);
    }

    #[test]
    fn stat_miss_is_memoized() {
        let mut cache = FileSystemCache::new();
        let missing = Path::new("/definitely/not/here.py");
        assert!(cache.stat(missing).is_err());
        assert!(!cache.is_file(missing));
        assert!(!cache.is_dir(missing));
    }
}
