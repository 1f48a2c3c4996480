use std::io::{self, Read, Write};
use std::path::PathBuf;

use tempfile::NamedTempFile;

use super::CacheEntry;

/// Produces cached objects and decides where they are stored.
///
/// The [`CacheDirectory`](super::CacheDirectory) calls into this from a dedicated generation
/// thread, hence the `Send + Sync + 'static` bounds.
pub trait Backend: Send + Sync + 'static {
    /// Extra data needed to regenerate an object, next to its key.
    type Info: Clone + Send + Sync + 'static;

    /// The path of the stable file for `key`.
    ///
    /// This must be deterministic, and two different keys must never map to the same path.
    fn make_filename(&self, key: &str) -> PathBuf;

    /// Creates a fresh temporary file outside of the stable namespace.
    ///
    /// It has to live on the same file system as the stable files so that it can be
    /// renamed into place.
    fn new_temp_file(&self) -> io::Result<NamedTempFile>;

    /// Writes the complete object for `key` into `writer`.
    fn generate(&self, writer: &mut dyn Write, key: &str, info: &Self::Info) -> CacheEntry;
}

/// Receives the bytes of a cached object on behalf of one caller.
pub trait Consumer<I: ?Sized> {
    /// Reads as much of `reader` as this caller needs and returns how many bytes it consumed.
    ///
    /// Errors returned by `reader` have to be passed back as they are: a
    /// [force-closed](super::is_force_closed) error makes the cache call this again with a
    /// reader that continues where the previous one stopped.
    fn copy_from(&mut self, reader: &mut dyn Read, key: &str, info: &I) -> io::Result<u64>;

    /// Whether this caller only needs to know that the object resolves.
    ///
    /// Such consumers never get to read, [`confirm_exists`](Self::confirm_exists) is called
    /// instead once the object is available.
    fn exists_only(&self) -> bool {
        false
    }

    /// Called instead of [`copy_from`](Self::copy_from) for [existence-only](Self::exists_only)
    /// consumers.
    fn confirm_exists(&mut self, key: &str, info: &I) -> io::Result<()> {
        let _ = (key, info);
        Ok(())
    }
}

/// A consumer that appends everything it reads to a buffer.
impl<I: ?Sized> Consumer<I> for Vec<u8> {
    fn copy_from(&mut self, reader: &mut dyn Read, _key: &str, _info: &I) -> io::Result<u64> {
        let n = reader.read_to_end(self)?;
        Ok(n as u64)
    }
}
