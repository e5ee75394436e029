//! Transform filters: header rewrites, mock responses, gRPC-Web framing,
//! and request aggregation.

pub mod aggregator;
pub mod grpc_web;
pub mod headers;
pub mod mock;
