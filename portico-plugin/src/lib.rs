//! Filter framework: execution phases, the per-request context, the filter
//! trait pair (factory + configured instance), chain assembly and the
//! immutable per-snapshot chain map.

pub mod chain;
pub mod plugin;
pub mod registry;
