//! Cache Module
//!
//! Write-behind buffering and read caching in front of a data interface.
//!
//! ## Responsibilities
//! - Absorb bursty writes into a sharded buffer, coalescing repeated writes
//!   to a key with the combinator before they reach the backend
//! - Flush periodically, on demand, and when the memory manager reclaims
//! - Serve reads from a bounded cache that remembers confirmed absence
//! - Warm the cache from the backend in the background
//! - Hold writers back under memory pressure or when flushes stop succeeding

mod layer;
mod read_cache;
mod write_buffer;

pub use layer::CachedDataInterface;
