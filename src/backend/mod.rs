//! Backend Module
//!
//! Reference storage engines implementing [`DataInterface`](crate::DataInterface).
//!
//! - [`MemoryDataInterface`]: ordered in-memory map, merge-on-write
//! - [`FileDataInterface`]: the same map, snapshotted to one file on flush
//!
//! Both hand out streams that copy entries out in chunks, so a long
//! iteration never holds the map lock while the caller works.

mod file;
mod memory;
mod store;

pub use file::FileDataInterface;
pub use memory::MemoryDataInterface;
