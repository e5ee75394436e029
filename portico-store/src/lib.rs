//! Snapshot publishing and configuration sources.
//!
//! A complete `ConfigSnapshot` is built off-path from a source, validated,
//! committed (router/chains/traffic state), and swapped in atomically. A
//! failed publish leaves the previous snapshot serving.

pub mod file;
pub mod publisher;

pub use file::{ConfigSource, FileSource};
pub use publisher::SnapshotHandle;
