//! A growing file shared by one writer and any number of readers.
//!
//! The writer appends to a temporary file and never waits for readers. Each reader keeps its
//! own offset and blocks until the writer got further ahead or the stream reached a terminal
//! state. Once the generation task closes the file, readers that are still behind receive a
//! [`ForceClosed`] error and are expected to continue from the stable file.

use std::io::{self, Read, Write};

use parking_lot::{Condvar, Mutex, RwLock};
use tempfile::{NamedTempFile, TempPath};

use super::CacheError;
use super::cache_error::{ForceClosed, into_io_error};
use super::fs::{read_at, write_at};

#[derive(Debug)]
enum Terminal {
    Finished,
    Cancelled(CacheError),
}

#[derive(Debug)]
struct Progress {
    /// Number of bytes that were written and can be read.
    written: u64,
    terminal: Option<Terminal>,
}

#[derive(Debug)]
pub struct GenerationStream {
    progress: Mutex<Progress>,
    changed: Condvar,
    file: RwLock<Option<NamedTempFile>>,
}

impl GenerationStream {
    pub fn new(file: NamedTempFile) -> Self {
        Self {
            progress: Mutex::new(Progress {
                written: 0,
                terminal: None,
            }),
            changed: Condvar::new(),
            file: RwLock::new(Some(file)),
        }
    }

    /// Returns a new reader at the start of the stream.
    pub fn new_reader(&self) -> StreamReader<'_> {
        self.reader_at(0)
    }

    /// Returns a new reader starting at `offset`.
    pub fn reader_at(&self, offset: u64) -> StreamReader<'_> {
        StreamReader {
            stream: self,
            offset,
        }
    }

    /// Returns the writing end of this stream.
    ///
    /// There must only ever be one writer per stream.
    pub fn writer(&self) -> StreamWriter<'_> {
        StreamWriter {
            stream: self,
            error: None,
        }
    }

    /// Marks the stream as complete.
    pub fn finish(&self) {
        self.terminate(Terminal::Finished);
    }

    /// Marks the stream as failed with `err`.
    ///
    /// Readers receive `err` after they consumed what was written until now.
    pub fn cancel(&self, err: CacheError) {
        self.terminate(Terminal::Cancelled(err));
    }

    fn terminate(&self, terminal: Terminal) {
        let mut progress = self.progress.lock();
        if progress.terminal.is_some() {
            return;
        }
        progress.terminal = Some(terminal);
        self.changed.notify_all();
    }

    /// Closes the backing file and hands its path to the caller.
    ///
    /// Readers that did not yet reach the end observe [`ForceClosed`] from now on.
    /// Returns `None` if the stream was already closed.
    pub fn close(&self) -> Option<TempPath> {
        let file = self.file.write().take();
        file.map(NamedTempFile::into_temp_path)
    }

    /// The number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.progress.lock().written
    }
}

/// A private cursor into a [`GenerationStream`].
#[derive(Debug)]
pub struct StreamReader<'a> {
    stream: &'a GenerationStream,
    offset: u64,
}

impl StreamReader<'_> {
    /// The number of bytes this reader consumed from the start of the stream.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut progress = self.stream.progress.lock();
        while self.offset >= progress.written {
            match &progress.terminal {
                Some(Terminal::Finished) => return Ok(0),
                Some(Terminal::Cancelled(err)) => return Err(into_io_error(err.clone())),
                None => self.stream.changed.wait(&mut progress),
            }
        }
        let available = progress.written - self.offset;
        drop(progress);

        let len = (buf.len() as u64).min(available) as usize;
        let guard = self.stream.file.read();
        let file = guard
            .as_ref()
            .ok_or_else(|| ForceClosed.into_io_error())?;
        let n = read_at(file.as_file(), &mut buf[..len], self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// The appending end of a [`GenerationStream`].
#[derive(Debug)]
pub struct StreamWriter<'a> {
    stream: &'a GenerationStream,
    error: Option<io::ErrorKind>,
}

impl StreamWriter<'_> {
    /// The kind of the first write error, if any write failed.
    pub fn error(&self) -> Option<io::ErrorKind> {
        self.error
    }

    fn write_inner(&mut self, buf: &[u8]) -> io::Result<usize> {
        // only this writer ever advances `written`
        let offset = self.stream.progress.lock().written;
        let n = {
            let guard = self.stream.file.read();
            let file = guard
                .as_ref()
                .ok_or_else(|| ForceClosed.into_io_error())?;
            write_at(file.as_file(), buf, offset)?
        };

        let mut progress = self.stream.progress.lock();
        progress.written += n as u64;
        self.stream.changed.notify_all();
        Ok(n)
    }
}

impl Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let result = self.write_inner(buf);
        if let Err(ref e) = result {
            self.error.get_or_insert(e.kind());
        }
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use crate::test;

    use super::*;
    use crate::caching::is_force_closed;

    fn stream(dir: &test::TempDir) -> GenerationStream {
        GenerationStream::new(NamedTempFile::new_in(dir.path()).unwrap())
    }

    #[test]
    fn test_readers_trail_writer() {
        test::setup();
        let dir = test::tempdir();
        let stream = stream(&dir);
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        thread::scope(|s| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut out = Vec::new();
                        stream.new_reader().read_to_end(&mut out).unwrap();
                        out
                    })
                })
                .collect();

            let mut writer = stream.writer();
            for chunk in data.chunks(4096) {
                writer.write_all(chunk).unwrap();
                thread::yield_now();
            }
            stream.finish();

            for reader in readers {
                assert_eq!(reader.join().unwrap(), data);
            }
        });
    }

    #[test]
    fn test_cancel_after_drain() {
        test::setup();
        let dir = test::tempdir();
        let stream = stream(&dir);

        stream.writer().write_all(b"partial").unwrap();
        stream.cancel(CacheError::GenerationFailed("broken".into()));
        // a second terminal state is ignored
        stream.finish();

        let mut reader = stream.new_reader();
        let mut buf = [0; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"partial");

        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(
            err.get_ref().and_then(|e| e.downcast_ref::<CacheError>()),
            Some(&CacheError::GenerationFailed("broken".into()))
        );
    }

    #[test]
    fn test_force_closed() {
        test::setup();
        let dir = test::tempdir();
        let stream = stream(&dir);

        stream.writer().write_all(b"hello world").unwrap();
        stream.finish();

        let mut done = stream.new_reader();
        let mut behind = stream.new_reader();
        let mut buf = [0; 5];
        behind.read_exact(&mut buf).unwrap();
        done.read_to_end(&mut Vec::new()).unwrap();

        let path = stream.close().unwrap();
        assert!(stream.close().is_none());

        // a reader that already got everything just sees the end
        assert_eq!(done.read(&mut buf).unwrap(), 0);

        let err = behind.read(&mut buf).unwrap_err();
        assert!(is_force_closed(&err));
        assert_eq!(behind.offset(), 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn test_blocked_reader_wakes_on_finish() {
        test::setup();
        let dir = test::tempdir();
        let stream = stream(&dir);
        let barrier = Barrier::new(2);

        thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut reader = stream.new_reader();
                barrier.wait();
                let mut out = Vec::new();
                reader.read_to_end(&mut out).unwrap();
                out
            });

            barrier.wait();
            stream.writer().write_all(b"abc").unwrap();
            stream.finish();
            assert_eq!(reader.join().unwrap(), b"abc");
        });
        assert_eq!(stream.written(), 3);
    }
}
