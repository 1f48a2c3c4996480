//! Newscache.
//!
//! Newscache serves news articles from a generate-once file cache. Articles are assembled from
//! their stored rows on first request and shared between all concurrent readers.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

#[cfg(test)]
use newscache_test as test;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
