//! Traffic management for Portico: target selection (round robin, smooth
//! weighted, least connections, consistent-hash IP affinity), active and
//! passive health views, and per-target circuit breaking.

pub mod active_health;
pub mod balancer;
pub mod breaker;
pub mod outcome;
pub mod passive_health;
pub mod ring;

pub use outcome::UpstreamOutcome;
