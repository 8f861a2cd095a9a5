//! Access table implementations.

mod access;

pub use access::StaticAccessTable;
