//! Portico data plane: thread-per-core monoio workers, raw HTTP/1.1
//! connection handling, the forwarder with its thread-local connection
//! pool, and the retry policy.

pub mod connection;
pub mod forward;
pub mod pool;
pub mod proxy;
pub mod worker;
