use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::{NamedTempFile, TempPath};

use crate::config::Config;

use super::cache_error::into_io_error;
use super::{CacheError, CacheKey};

/// The file system side of a cache.
///
/// Stable files live in `<cache_dir>/<name>`, files that are still being generated in the
/// sibling `<cache_dir>/tmp`, so that publishing is a rename within one file system.
#[derive(Debug, Clone)]
pub struct Cache {
    /// Cache identifier used for metric names.
    name: &'static str,

    /// Directory to use for storing stable cache items. Will be created if it does not exist.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// New items are written to a temporary file in here and moved into
    /// [`cache_dir`](Self::cache_dir) once fully written.
    tmp_dir: PathBuf,
}

impl Cache {
    pub fn from_config(name: &'static str, config: &Config) -> io::Result<Self> {
        let root = config.cache_dir.as_deref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "no cache_dir configured! Did you provide a path to your config file?",
            )
        })?;
        Self::new(name, root)
    }

    /// Creates the cache below `root`, creating its directories.
    pub fn new(name: &'static str, root: &Path) -> io::Result<Self> {
        let cache_dir = root.join(name);
        let tmp_dir = root.join("tmp");

        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Cache {
            name,
            cache_dir,
            tmp_dir,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// The absolute path of the stable file for `key`.
    pub fn stable_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.cache_path())
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        let path = &self.tmp_dir;
        // The `cleanup` process could potentially remove the parent directories we are
        // operating in, so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(path) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Moves a finished temporary file to its stable location, without replacing anything.
///
/// Returns `false` if another file already occupies `path`. That file has the same
/// contents, so this is not an error; the temporary file is deleted instead.
pub fn persist_noclobber(mut temp: TempPath, path: &Path) -> io::Result<bool> {
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", parent.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }
        }

        match temp.persist_noclobber(path) {
            Ok(()) => return Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!("Cache file `{}` already exists", path.display());
                return Ok(false);
            }
            Err(e) => {
                if retries > MAX_RETRIES {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to persist cache file: {:?}", e.error),
                    );
                    return Err(e.error);
                }
                // the parent may have been removed by a concurrent cleanup
                temp = e.path;
            }
        }
    }
}

/// An open, read-only handle to a published stable file.
///
/// The handle is shared by all callers of one slot, each of which reads with its own
/// offset. It can be closed early, after which reads fail with
/// [`CacheError::ForcedByTimeout`].
#[derive(Debug)]
pub struct StableFile {
    file: RwLock<Option<File>>,
}

impl StableFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file: RwLock::new(Some(file)),
        })
    }

    /// Releases the file handle.
    pub fn close(&self) {
        self.file.write().take();
    }

    /// Returns a reader starting at `offset`.
    pub fn reader_at(&self, offset: u64) -> FileReader<'_> {
        FileReader { file: self, offset }
    }
}

/// A positioned reader over a [`StableFile`].
#[derive(Debug)]
pub struct FileReader<'a> {
    file: &'a StableFile,
    offset: u64,
}

impl FileReader<'_> {
    /// The number of bytes from the start of the file this reader is at.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let guard = self.file.file.read();
        let file = guard
            .as_ref()
            .ok_or_else(|| into_io_error(CacheError::ForcedByTimeout))?;
        let n = read_at(file, buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

#[cfg(unix)]
pub(super) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
pub(super) fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
pub(super) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
pub(super) fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::test;

    use super::*;

    #[test]
    fn test_layout() {
        test::setup();
        let root = test::tempdir();
        let cache = Cache::new("articles", root.path()).unwrap();

        assert!(root.path().join("articles").is_dir());
        assert!(root.path().join("tmp").is_dir());

        let temp = cache.tempfile().unwrap();
        assert_eq!(temp.path().parent(), Some(cache.tmp_dir()));
        assert!(
            temp.path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("tmp")
        );
    }

    #[test]
    fn test_tempfile_recreates_dir() {
        test::setup();
        let root = test::tempdir();
        let cache = Cache::new("articles", root.path()).unwrap();

        std::fs::remove_dir_all(cache.tmp_dir()).unwrap();
        assert!(cache.tempfile().is_ok());
    }

    #[test]
    fn test_persist_noclobber() {
        test::setup();
        let root = test::tempdir();
        let cache = Cache::new("articles", root.path()).unwrap();
        let path = cache.stable_path(&CacheKey::new("<a@b>"));

        let mut first = cache.tempfile().unwrap();
        first.write_all(b"first").unwrap();
        assert!(persist_noclobber(first.into_temp_path(), &path).unwrap());

        let mut second = cache.tempfile().unwrap();
        second.write_all(b"second").unwrap();
        let second = second.into_temp_path();
        let second_path = second.to_path_buf();
        assert!(!persist_noclobber(second, &path).unwrap());

        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        assert!(!second_path.exists());
    }

    #[test]
    fn test_stable_file_reader() {
        test::setup();
        let root = test::tempdir();
        let path = root.path().join("file");
        std::fs::write(&path, b"hello world").unwrap();

        let file = StableFile::open(&path).unwrap();
        let mut reader = file.reader_at(6);
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "world");
        assert_eq!(reader.offset(), 11);

        file.close();
        let mut reader = file.reader_at(0);
        let err = reader.read(&mut [0; 4]).unwrap_err();
        assert_eq!(
            err.get_ref().and_then(|e| e.downcast_ref::<CacheError>()),
            Some(&CacheError::ForcedByTimeout)
        );
    }
}
