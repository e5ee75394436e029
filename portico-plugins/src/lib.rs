//! Built-in filter kinds. `register_all` wires every kind into a registry;
//! filters needing shared services (circuit breakers, the background HTTP
//! sidecar) receive them here.

pub mod auth;
pub mod sidecar;
pub mod traffic;
pub mod transform;

use portico_balance::breaker::BreakerRegistry;
use portico_plugin::registry::FilterRegistry;
use sidecar::SidecarClient;
use std::sync::Arc;

/// Shared services handed to filter factories at registration.
#[derive(Clone)]
pub struct FilterDeps {
    pub breakers: Arc<BreakerRegistry>,
    pub sidecar: Arc<SidecarClient>,
}

/// Register every built-in filter kind.
pub fn register_all(registry: &mut FilterRegistry, deps: FilterDeps) {
    registry.register(Arc::new(auth::AuthFilterFactory {
        sidecar: Arc::clone(&deps.sidecar),
    }));
    registry.register(Arc::new(traffic::rate_limit::RateLimitFactory));
    registry.register(Arc::new(traffic::ip_acl::IpAclFactory));
    registry.register(Arc::new(traffic::cors::CorsFactory));
    registry.register(Arc::new(traffic::circuit_breaker::CircuitBreakerFactory {
        breakers: Arc::clone(&deps.breakers),
    }));
    registry.register(Arc::new(traffic::mirror::MirrorFactory {
        sidecar: Arc::clone(&deps.sidecar),
    }));
    registry.register(Arc::new(transform::headers::HeaderTransformFactory));
    registry.register(Arc::new(transform::mock::MockResponseFactory));
    registry.register(Arc::new(transform::grpc_web::GrpcWebFactory));
    registry.register(Arc::new(transform::aggregator::AggregatorFactory {
        sidecar: deps.sidecar,
    }));
}
