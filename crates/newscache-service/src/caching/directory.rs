use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::config::CachesConfig;
use crate::utils::defer::defer;

use super::backend::{Backend, Consumer};
use super::fs::{StableFile, persist_noclobber};
use super::slot::{Slot, SlotState};
use super::stream::GenerationStream;
use super::{CacheEntry, CacheError, ObtainError, is_force_closed};

/// The map from keys to their cache slots.
///
/// There is exactly one of these per cache and process. It guarantees that, for every key,
/// at most one generation runs at a time, while any number of callers share its result.
pub struct CacheDirectory<B: Backend> {
    /// Cache identifier used for metric names.
    name: &'static str,
    backend: Arc<B>,
    config: CachesConfig,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    running: Arc<RunningGenerations>,
}

/// Slots whose generation thread is still running, by key.
///
/// A slot leaves the directory as soon as its last caller detached, but its generation goes
/// on and eventually renames its file into place. Invalidations wait for these as well.
#[derive(Debug, Default)]
struct RunningGenerations {
    slots: Mutex<HashMap<String, Vec<Arc<Slot>>>>,
}

impl RunningGenerations {
    fn register(&self, key: &str, slot: &Arc<Slot>) {
        self.slots
            .lock()
            .entry(key.to_owned())
            .or_default()
            .push(Arc::clone(slot));
    }

    fn unregister(&self, key: &str, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        if let Some(running) = slots.get_mut(key) {
            running.retain(|other| !Arc::ptr_eq(other, slot));
            if running.is_empty() {
                slots.remove(key);
            }
        }
    }

    fn get(&self, key: &str) -> Vec<Arc<Slot>> {
        self.slots.lock().get(key).cloned().unwrap_or_default()
    }
}

impl<B: Backend> fmt::Debug for CacheDirectory<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheDirectory")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("slots", &self.slots.read().len())
            .finish()
    }
}

/// A started invalidation.
///
/// While this is alive, the key is held by a placeholder slot, so callers of
/// [`CacheDirectory::obtain`] for it wait instead of generating. Hand it back to
/// [`CacheDirectory::invalidate_finish`] to release them.
#[derive(Debug)]
#[must_use = "an invalidation blocks its key until it is finished"]
pub struct Invalidation {
    key: String,
    placeholder: Arc<Slot>,
}

impl Invalidation {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// How one obtain attempt ended.
enum Attempt {
    Done,
    Restart,
}

impl<B: Backend> CacheDirectory<B> {
    pub fn new(name: &'static str, backend: B, config: CachesConfig) -> Self {
        Self {
            name,
            backend: Arc::new(backend),
            config,
            slots: RwLock::new(HashMap::new()),
            running: Arc::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The number of keys that currently have a slot.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(super) fn slot(&self, key: &str) -> Option<Arc<Slot>> {
        self.slots.read().get(key).cloned()
    }

    /// Delivers the object for `key` to `consumer`, generating it first if necessary.
    ///
    /// Concurrent calls for the same key share one generation. Callers that attach while it
    /// is running read along from the growing temporary file, and are moved over to the
    /// stable file transparently once it is published.
    ///
    /// There is no timeout: if the backend never returns, neither does this.
    pub fn obtain<C>(&self, consumer: &mut C, key: &str, info: &B::Info) -> Result<(), ObtainError>
    where
        C: Consumer<B::Info> + ?Sized,
    {
        metric!(counter("caches.access") += 1, "cache" => self.name);

        let mut offset = 0;
        for _ in 0..=self.config.max_restarts {
            let (slot, elected) = self.attach(key);
            let _release = defer(|| self.release(key, &slot));

            if elected {
                self.start_generation(&slot, key, info);
            }

            match self.consume(&slot, consumer, key, info, &mut offset)? {
                Attempt::Done => return Ok(()),
                Attempt::Restart => {
                    metric!(counter("caches.restart") += 1, "cache" => self.name);
                    tracing::trace!(key, "Cache slot turned moot, starting over");
                }
            }
        }

        Err(CacheError::TooManyRestarts(self.config.max_restarts).into())
    }

    /// Finds the slot for `key` and takes a reference on it, or installs a fresh one.
    ///
    /// Returns `true` alongside the slot if this caller installed it, which makes it the
    /// generator for that slot.
    fn attach(&self, key: &str) -> (Arc<Slot>, bool) {
        loop {
            let existing = self.slots.read().get(key).cloned();
            if let Some(slot) = existing {
                if slot.try_acquire() {
                    return (slot, false);
                }
                // the slot is being torn down, wait for it to disappear
                thread::yield_now();
                continue;
            }

            let fresh = Arc::new(Slot::new());
            let mut slots = self.slots.write();
            let existing = match slots.entry(key.to_owned()) {
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&fresh));
                    return (fresh, true);
                }
                Entry::Occupied(entry) => Arc::clone(entry.get()),
            };
            drop(slots);

            if existing.try_acquire() {
                return (existing, false);
            }
            thread::yield_now();
        }
    }

    /// Gives up a reference on `slot`, collecting it if it was the last one.
    fn release(&self, key: &str, slot: &Arc<Slot>) {
        if !slot.release() {
            return;
        }

        {
            let mut slots = self.slots.write();
            // an invalidation may have replaced it already
            if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
                slots.remove(key);
            }
        }
        slot.close_file();
        tracing::trace!(key, "Collected cache slot");
    }

    /// Publishes the first state of a freshly installed slot.
    ///
    /// This either serves an existing stable file, or starts a generation thread.
    fn start_generation(&self, slot: &Arc<Slot>, key: &str, info: &B::Info) {
        let stable_path = self.backend.make_filename(key);

        match StableFile::open(&stable_path) {
            Ok(file) => {
                metric!(counter("caches.file.hit") += 1, "cache" => self.name);
                slot.publish(SlotState::Ready(Arc::new(file)));
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                slot.publish(SlotState::Failed(e.into()));
                return;
            }
        }

        let temp_file = match self.backend.new_temp_file() {
            Ok(temp_file) => temp_file,
            Err(e) => {
                slot.publish(SlotState::Failed(e.into()));
                return;
            }
        };

        metric!(counter("caches.computation") += 1, "cache" => self.name);
        let stream = Arc::new(GenerationStream::new(temp_file));
        slot.publish(SlotState::Generating(Arc::clone(&stream)));

        self.running.register(key, slot);
        let task = GenerationTask {
            name: self.name,
            backend: Arc::clone(&self.backend),
            running: Arc::clone(&self.running),
            slot: Arc::clone(slot),
            stream: Arc::clone(&stream),
            key: key.to_owned(),
            info: info.clone(),
            stable_path,
        };
        let spawned = thread::Builder::new()
            .name("cache-generator".into())
            .spawn(move || task.run());

        if let Err(e) = spawned {
            let err = CacheError::from(e);
            stream.cancel(err.clone());
            drop(stream.close());
            slot.publish(SlotState::Failed(err));
            self.running.unregister(key, slot);
        }
    }

    /// Hands the object to `consumer` once `slot` has something to offer.
    ///
    /// `offset` is the number of bytes the consumer already received and is kept up to date
    /// when reading from the live stream, so reading can resume from the stable file.
    fn consume<C>(
        &self,
        slot: &Slot,
        consumer: &mut C,
        key: &str,
        info: &B::Info,
        offset: &mut u64,
    ) -> Result<Attempt, ObtainError>
    where
        C: Consumer<B::Info> + ?Sized,
    {
        let mut state = slot.wait_published();
        loop {
            match state {
                SlotState::Empty => state = slot.wait_published(),
                SlotState::Generating(_) if consumer.exists_only() => {
                    state = slot.wait_settled();
                }
                SlotState::Generating(stream) => {
                    metric!(counter("caches.stream.attach") += 1, "cache" => self.name);
                    let mut reader = stream.reader_at(*offset);
                    let result = consumer.copy_from(&mut reader, key, info);
                    *offset = reader.offset();

                    match result {
                        Ok(_) => {
                            // stay attached until the stable file is in place, so that the
                            // next caller finds it instead of generating again
                            slot.wait_settled();
                            return Ok(Attempt::Done);
                        }
                        Err(e) if is_force_closed(&e) => {
                            metric!(counter("caches.stream.resume") += 1, "cache" => self.name);
                            tracing::trace!(key, offset = *offset, "Resuming from stable file");
                            state = slot.wait_settled();
                        }
                        Err(e) => return Err(ObtainError::from_consumer(e)),
                    }
                }
                SlotState::Ready(file) => {
                    if consumer.exists_only() {
                        consumer
                            .confirm_exists(key, info)
                            .map_err(ObtainError::Consumer)?;
                    } else {
                        let mut reader = file.reader_at(*offset);
                        let result = consumer.copy_from(&mut reader, key, info);
                        *offset = reader.offset();
                        result.map_err(ObtainError::from_consumer)?;
                    }
                    return Ok(Attempt::Done);
                }
                SlotState::Failed(err) => return Err(err.into()),
                SlotState::Restart => return Ok(Attempt::Restart),
            }
        }
    }

    /// Starts invalidating `key`.
    ///
    /// A placeholder takes over the key right away, so no new generation can start until
    /// [`invalidate_finish`](Self::invalidate_finish) is called. Then the stable file is
    /// deleted, after waiting for every generation that is still running for the key. That
    /// includes generations of slots which were collected already.
    ///
    /// With `drain_before_delete`, readers of the displaced slot get `drain_timeout` to let go
    /// of the file, after which it is closed under them.
    ///
    /// The returned [`Invalidation`] has to be finished even if deleting failed.
    pub fn invalidate_start(&self, key: &str) -> (Invalidation, CacheEntry) {
        metric!(counter("caches.invalidate") += 1, "cache" => self.name);

        let placeholder = Arc::new(Slot::new());
        let displaced = self
            .slots
            .write()
            .insert(key.to_owned(), Arc::clone(&placeholder));

        // a generation that is still running would publish a stale file after we delete
        for running in self.running.get(key) {
            if !running.state().is_settled() {
                tracing::debug!(key, "Waiting for running generation before invalidating");
                running.wait_settled();
            }
        }

        if let Some(displaced) = displaced {
            // it may not have started its generation yet
            let state = displaced.wait_settled();

            if self.config.drain_before_delete
                && matches!(state, SlotState::Ready(_))
                && !displaced.drain(self.config.drain_timeout)
            {
                metric!(counter("caches.invalidate.forced") += 1, "cache" => self.name);
                tracing::warn!(
                    key,
                    refcount = displaced.refcount(),
                    "Readers did not let go of invalidated cache file in time",
                );
                displaced.force_fail(CacheError::ForcedByTimeout);
            }
        }

        let path = self.backend.make_filename(key);
        let result = match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(key, path = %path.display(), "Deleted cache file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };

        let invalidation = Invalidation {
            key: key.to_owned(),
            placeholder,
        };
        (invalidation, result)
    }

    /// Releases the key held by `invalidation`.
    ///
    /// Callers that were waiting on the placeholder start over and generate afresh.
    pub fn invalidate_finish(&self, invalidation: Invalidation) {
        let Invalidation { key, placeholder } = invalidation;
        placeholder.retire();

        let mut slots = self.slots.write();
        if slots
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &placeholder))
        {
            slots.remove(&key);
        }
    }

    /// Invalidates `key` in one go.
    pub fn invalidate(&self, key: &str) -> CacheEntry {
        let (invalidation, result) = self.invalidate_start(key);
        self.invalidate_finish(invalidation);
        result
    }
}

/// Everything the generation thread of one slot needs.
struct GenerationTask<B: Backend> {
    name: &'static str,
    backend: Arc<B>,
    running: Arc<RunningGenerations>,
    slot: Arc<Slot>,
    stream: Arc<GenerationStream>,
    key: String,
    info: B::Info,
    stable_path: PathBuf,
}

impl<B: Backend> GenerationTask<B> {
    fn run(self) {
        let _unregister = defer(|| self.running.unregister(&self.key, &self.slot));

        let start = Instant::now();
        let result = self.generate();
        metric!(timer("caches.computation.duration") = start.elapsed(), "cache" => self.name);

        match &result {
            Ok(()) => self.stream.finish(),
            Err(err) => self.stream.cancel(err.clone()),
        }
        // readers that are still behind get force-closed here
        let temp_path = self.stream.close();

        let result = result.and_then(|()| {
            let temp_path = temp_path.ok_or_else(|| {
                CacheError::InternalError("generation stream was closed twice".into())
            })?;
            persist_noclobber(temp_path, &self.stable_path)?;
            Ok(())
        });

        if let Err(err) = result {
            metric!(counter("caches.generation.failed") += 1, "cache" => self.name);
            tracing::debug!(key = %self.key, error = %err, "Generating cache file failed");
            self.slot.publish(SlotState::Failed(err));
            return;
        }

        metric!(histogram("caches.file.size") = self.stream.written(), "cache" => self.name);

        if self.slot.refcount() == 0 {
            // everybody read straight from the stream and left already
            self.slot.publish(SlotState::Restart);
            return;
        }
        match StableFile::open(&self.stable_path) {
            Ok(file) => self.slot.publish_ready(file),
            Err(e) => self.slot.publish(SlotState::Failed(e.into())),
        }
    }

    fn generate(&self) -> CacheEntry {
        let mut writer = self.stream.writer();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.backend.generate(&mut writer, &self.key, &self.info)
        }));

        match result {
            Ok(Ok(())) => match writer.error() {
                Some(kind) => Err(CacheError::GenerationFailed(format!(
                    "writing generated object failed: {kind}"
                ))),
                None => Ok(()),
            },
            Ok(Err(err)) => Err(err),
            Err(_) => {
                tracing::error!(key = %self.key, "Cache generator panicked");
                Err(CacheError::GenerationFailed("generator panicked".into()))
            }
        }
    }
}
