//! The storage engine: a framing codec, a recency cache, and a key index
//! composed around a single append-only log file.

mod bitstore;
mod cache;
mod codec;
mod index;

pub use bitstore::{BitStore, Stats, DEFAULT_CACHE_CAPACITY};
