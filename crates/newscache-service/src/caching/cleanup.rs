use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::path::Path;

use anyhow::Result;

use crate::config::Config;

use super::Cache;
use super::fs::catch_not_found;

/// Entry function for the cleanup command.
///
/// Clears leftover temporary files and prunes the article cache.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let cache = Cache::from_config("articles", config)?;
    if !dry_run {
        cache.clear_tmp()?;
    }
    cache.cleanup(dry_run)
}

#[derive(Debug, Default)]
struct CleanupStats {
    removed_dirs: usize,
    removed_files: usize,

    retained_dirs: usize,
    retained_files: usize,
    retained_bytes: u64,
}

impl Cache {
    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid accidentally leaving temporary files which
    /// survive a hard crash. Must not run while another process generates into this cache.
    pub fn clear_tmp(&self) -> io::Result<()> {
        let tmp = self.tmp_dir();
        if tmp.exists() {
            std::fs::remove_dir_all(tmp)?;
        }
        std::fs::create_dir_all(tmp)?;
        Ok(())
    }

    /// Removes empty stable files and the directories left empty by invalidation.
    ///
    /// A stable file is never legitimately empty, as even an article without a body
    /// carries headers. If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<()> {
        tracing::info!("Cleaning up `{}` cache", self.name());

        let mut stats = CleanupStats::default();
        self.cleanup_directory_recursive(self.cache_dir(), &mut stats, dry_run)?;

        tracing::info!("Cleaning up `{}` complete", self.name());
        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} empty files",
            stats.removed_dirs,
            stats.removed_files,
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => self.name());
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => self.name());
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64, "cache" => self.name());

        Ok(())
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, stats, dry_run)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !dry_run {
                        if let Err(e) = remove_dir(&path) {
                            sentry::with_scope(
                                |scope| scope.set_extra("path", path.display().to_string().into()),
                                || tracing::error!("Failed to clean cache directory: {:?}", e),
                            );
                            dir_is_empty = false;
                        }
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats, dry_run) {
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to clean cache file: {:?}", e),
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Removes `path` if it is an empty file, returning `true` if it is gone afterwards.
    fn try_cleanup_path(&self, path: &Path, stats: &mut CleanupStats, dry_run: bool) -> Result<bool> {
        let len = match catch_not_found(|| path.metadata())? {
            Some(metadata) => metadata.len(),
            // removed concurrently
            None => return Ok(true),
        };

        if len > 0 {
            stats.retained_files += 1;
            stats.retained_bytes += len;
            return Ok(false);
        }

        tracing::debug!("Removing empty file `{}`", path.display());
        if !dry_run {
            catch_not_found(|| remove_file(path))?;
        }
        stats.removed_files += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::test;

    use super::*;
    use crate::caching::CacheKey;

    #[test]
    fn test_cleanup() {
        test::setup();
        let root = test::tempdir();
        let cache = Cache::new("articles", root.path()).unwrap();

        let kept = cache.stable_path(&CacheKey::new("<kept@example.com>"));
        let empty = cache.stable_path(&CacheKey::new("<empty@example.com>"));
        for path in [&kept, &empty] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        }
        std::fs::write(&kept, b"Subject: kept\n\nbody\n").unwrap();
        std::fs::write(&empty, b"").unwrap();
        std::fs::create_dir_all(cache.cache_dir().join("zz/empty")).unwrap();

        cache.cleanup(true).unwrap();
        assert!(empty.exists());
        assert!(cache.cache_dir().join("zz/empty").exists());

        cache.cleanup(false).unwrap();
        assert!(kept.exists());
        assert!(!empty.exists());
        assert!(!cache.cache_dir().join("zz").exists());
        // the directory of the kept file is still there
        assert!(cache.cache_dir().is_dir());
    }

    #[test]
    fn test_clear_tmp() {
        test::setup();
        let root = test::tempdir();
        let cache = Cache::new("articles", root.path()).unwrap();

        let leftover = cache.tempfile().unwrap().into_temp_path().keep().unwrap();
        assert!(leftover.exists());

        cache.clear_tmp().unwrap();
        assert!(!leftover.exists());
        assert!(cache.tmp_dir().is_dir());
    }
}
