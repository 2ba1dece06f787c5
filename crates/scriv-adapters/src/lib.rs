//! Runtime adapters for Scriv (persistence, document store, cache,
//! configuration).

pub mod cache;
pub mod config;
pub mod persist;
pub mod store;
