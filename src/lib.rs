//! # keystack
//!
//! Layered key-value data interfaces over `i64` keys:
//! - Combinator-based write merging (sum, max, union, uniqueness, ...)
//! - Bloom-filter layer answering "definitely absent" without backend I/O
//! - Cached layer with a sharded write buffer and a bounded read cache
//! - Cooperative memory management across layers
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Client                               │
//! │                  (any number of threads)                     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ DataInterface<T>
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 CachedDataInterface                          │
//! │        (write shards + read cache + flush task)              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ DataInterface<T>
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │               BloomFilterDataInterface                       │──┐
//! │          (ArcSwap filter + rebuild + persist task)           │  │ side store
//! └─────────────────────┬───────────────────────────────────────┘  │
//!                       │ DataInterface<T>                         ▼
//!          ┌────────────┴────────────┐               DataInterface<LongBloomFilter>
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Memory    │          │    File     │
//!   │  (BTreeMap) │          │ (snapshot)  │
//!   └─────────────┘          └─────────────┘
//! ```
//!
//! The layers are decorators: each one holds the next as an
//! `Arc<dyn DataInterface<T>>`, so they stack in any order.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod combinator;
pub mod interface;
pub mod backend;
pub mod memory;
pub mod bloom;
pub mod cache;
pub mod task;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{KeystackError, Result};
pub use config::{BloomConfig, CacheConfig};
pub use combinator::{Combinator, MergeRefused, SharedCombinator};
pub use interface::{DataInterface, DataStream, KeyValue, Value};
pub use backend::{FileDataInterface, MemoryDataInterface};
pub use memory::{BudgetMemoryManager, MemoryGobbler, MemoryManager, MemoryStatus};
pub use bloom::{BloomFilterDataInterface, LongBloomFilter};
pub use cache::CachedDataInterface;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of keystack
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
