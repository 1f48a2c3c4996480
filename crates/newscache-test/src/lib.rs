//! Helpers for testing the article cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Generation threads may still be writing into it after the
//!    obtaining call returned, so keep it alive until those are done as well.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `newscache` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("newscache_service=trace,newscache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A deterministic byte pattern of the given length.
///
/// The pattern does not repeat at power-of-two boundaries, so that shifted or duplicated
/// chunks are detected when comparing.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Contents of a small article store with two groups.
///
/// - `misc.test` holds articles 1 and 2, where 2 has a multi-line body with lines that need
///   dot-stuffing.
/// - `misc.empty` exists but has no articles.
/// - Post 3 is in `misc.test` as number 3, but was banned.
pub fn article_store() -> Value {
    json!({
        "groups": ["misc.test", "misc.empty"],
        "posts": [
            {
                "id": 1,
                "message_id": "<first@example.com>",
                "group": "misc.test",
                "number": 1,
                "headers": [
                    ["From", "Alice <alice@example.com>"],
                    ["Subject", "Hello"],
                    ["Date", "Mon, 05 Oct 2026 12:00:00 +0000"]
                ],
                "body": "Hello world\n"
            },
            {
                "id": 2,
                "message_id": "<second@example.com>",
                "group": "misc.test",
                "number": 2,
                "headers": [
                    ["From", "Bob <bob@example.com>"],
                    ["Subject", "Re: Hello"],
                    ["References", "<first@example.com>"]
                ],
                "body": "line one\n.dotted line\n..\nlast line"
            },
            {
                "id": 3,
                "message_id": "<banned@example.com>",
                "group": "misc.test",
                "number": 3,
                "headers": [["Subject", "Spam"]],
                "body": "buy now\n",
                "banned": true
            }
        ]
    })
}

/// Writes `value` as JSON to `name` in `dir`, returning the full path.
pub fn write_json(dir: &Path, name: &str, value: &Value) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
    path
}
