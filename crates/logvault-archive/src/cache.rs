//! Per-archive file cache: one entry per watched directory, one record per
//! tracked file. Only the archive's event loop touches this state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Upload progress of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileStatus {
    WaitUpload,
    Uploading,
    Uploaded,
}

/// Mutable record for a tracked file.
#[derive(Debug)]
pub(crate) struct FileInfo {
    pub status: FileStatus,
    pub upload_failed_count: u32,
    pub delete_failed_count: u32,
    /// Earliest unix second the file is eligible for upload.
    pub protected_end_time: i64,
}

impl FileInfo {
    pub fn waiting(protected_end_time: i64) -> Self {
        Self {
            status: FileStatus::WaitUpload,
            upload_failed_count: 0,
            delete_failed_count: 0,
            protected_end_time,
        }
    }
}

/// Files tracked under one watched directory.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    /// The configured root this directory descends from.
    pub root_path: PathBuf,
    pub files: HashMap<PathBuf, FileInfo>,
}

/// Identifies one tracked file; handed to the delete workers.
#[derive(Debug, Clone)]
pub(crate) struct CacheKey {
    pub watch_path: PathBuf,
    pub file_path: PathBuf,
}

/// watch directory -> tracked files.
#[derive(Debug, Default)]
pub(crate) struct FileCache {
    entries: HashMap<PathBuf, CacheEntry>,
}

impl FileCache {
    pub fn contains_dir(&self, dir: &Path) -> bool {
        self.entries.contains_key(dir)
    }

    pub fn insert_dir(&mut self, dir: PathBuf, entry: CacheEntry) {
        self.entries.insert(dir, entry);
    }

    pub fn remove_dir(&mut self, dir: &Path) {
        self.entries.remove(dir);
    }

    pub fn entry_mut(&mut self, dir: &Path) -> Option<&mut CacheEntry> {
        self.entries.get_mut(dir)
    }

    pub fn get_file_mut(&mut self, watch_path: &Path, file_path: &Path) -> Option<&mut FileInfo> {
        self.entries
            .get_mut(watch_path)
            .and_then(|entry| entry.files.get_mut(file_path))
    }

    pub fn remove_file(&mut self, watch_path: &Path, file_path: &Path) {
        if let Some(entry) = self.entries.get_mut(watch_path) {
            entry.files.remove(file_path);
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PathBuf, &mut CacheEntry)> {
        self.entries.iter_mut()
    }

    /// Total tracked files across every directory.
    pub fn file_count(&self) -> usize {
        self.entries.values().map(|e| e.files.len()).sum()
    }
}
