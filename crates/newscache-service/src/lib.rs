#[macro_use]
pub mod metrics;

pub mod articles;
pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;

#[cfg(test)]
pub use newscache_test as test;
