//! Bloom Filter Module
//!
//! Probabilistic existence index in front of a data interface.
//!
//! ## Responsibilities
//! - Answer "definitely absent" without backend I/O
//! - Keep the filter live on writes, detect staleness by checksum
//! - Rebuild by a full ordered key scan, without blocking readers
//! - Persist/reload the filter through a side-store data interface
//!
//! The filter is an optimization only: every "might contain" is verified
//! against the wrapped interface, and persistence failures are logged and
//! otherwise ignored.

mod filter;
mod layer;

pub use filter::LongBloomFilter;
pub use layer::BloomFilterDataInterface;
