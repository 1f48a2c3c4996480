//! # Article caching infrastructure
//!
//! Assembling an article from its stored parts is expensive but deterministic, so every
//! article is generated at most once and then served from a file. This module contains the
//! machinery that makes sure this also holds under concurrency, together with our central
//! [`CacheError`] type.
//!
//! ## Overview
//!
//! The [`CacheDirectory`] maps keys to slots. A slot is the per-key unit of coordination:
//! a reference count of the callers interested in it, plus a state that only moves forward,
//! from empty, to generating, to ready, or to failed.
//!
//! A call to [`CacheDirectory::obtain`] goes through the following steps:
//!
//! - Attach to the slot of the key, or install a fresh one. Whoever installs the slot is its
//!   generator, all other callers merely consume.
//! - The generator first looks for an existing stable file, named by
//!   [`Backend::make_filename`]. If there is one, the slot becomes ready right away.
//! - Otherwise the generator opens a temporary file, wraps it in a generation stream and
//!   runs [`Backend::generate`] on a separate thread. The finished file is renamed into its
//!   stable place, without ever replacing an existing file, and reopened for reading.
//! - Every caller, the generator included, hands the bytes to its own [`Consumer`]. While the
//!   generation is running, consumers read along from the growing temporary file. Once it is
//!   closed, readers that are still behind receive a [force-closed](is_force_closed) error,
//!   and continue from the stable file at the exact offset they stopped at.
//! - On the way out every caller gives up its reference. The last one removes the slot from
//!   the directory and closes its file.
//!
//! Errors are recorded on the slot and delivered to everybody attached to it, but they are
//! not persisted. As slots are collected as soon as nobody holds them, the next obtain after a
//! failure tries again.
//!
//! ## Invalidation
//!
//! Invalidation is split into two phases. [`CacheDirectory::invalidate_start`] installs a
//! placeholder slot for the key, so that no new generation can start, waits for a running
//! generation of the displaced slot and deletes the stable file.
//! [`CacheDirectory::invalidate_finish`] retires the placeholder, which sends callers that
//! queued up behind it back to the start, where they generate a fresh file.
//!
//! Some platforms can not delete files that are still open. With
//! [`drain_before_delete`](crate::config::CachesConfig::drain_before_delete), invalidation
//! first waits for readers of the displaced slot to go away. After
//! [`drain_timeout`](crate::config::CachesConfig::drain_timeout), the file is closed under
//! them and they fail with [`CacheError::ForcedByTimeout`].
//!
//! ## Locking
//!
//! The directory has one lock that guards nothing but the map. Every slot has its own mutex
//! and condition variable. The directory lock is never held while waiting on a slot, and
//! slot locks are never held during file I/O.
//!
//! ## Metrics
//!
//! All metrics are tagged with the `cache` name:
//!
//! - `caches.access`: All calls to obtain.
//! - `caches.file.hit`: Slots that were served from an existing stable file.
//! - `caches.computation`: Actual generations.
//! - `caches.computation.duration`: How long generations took.
//! - `caches.generation.failed`: Generations that failed, including publishing the file.
//! - `caches.file.size`: The size of freshly generated files.
//! - `caches.stream.attach`: Callers that read from a running generation.
//! - `caches.stream.resume`: Callers that were handed over from the stream to the stable file.
//! - `caches.restart`: Obtain attempts that had to start over.
//! - `caches.invalidate`, `caches.invalidate.forced`: Invalidations, and those that had to
//!   close the file under remaining readers.

mod backend;
mod cache_error;
mod cache_key;
mod cleanup;
mod directory;
mod fs;
mod slot;
mod stream;

pub use backend::{Backend, Consumer};
pub use cache_error::{CacheEntry, CacheError, ForceClosed, ObtainError, is_force_closed};
pub use cache_key::CacheKey;
pub use cleanup::cleanup;
pub use directory::{CacheDirectory, Invalidation};
pub use fs::Cache;
