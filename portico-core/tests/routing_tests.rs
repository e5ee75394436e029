//! End-to-end routing behavior over published snapshots: precedence,
//! predicate filtering, and snapshot replacement visibility.

use portico_core::router::{CompiledRouter, Router, percent_decode_path};
use portico_core::snapshot::{ConfigSnapshot, GatewayState};

fn snapshot(yaml: &str, version: u64) -> ConfigSnapshot {
    let state: GatewayState = serde_yaml::from_str(yaml).unwrap();
    ConfigSnapshot::from_state(state, version).unwrap()
}

fn router(yaml: &str) -> Router {
    let snap = snapshot(yaml, 1);
    let r = Router::new();
    r.reload(CompiledRouter::build(&snap).unwrap());
    r
}

const API_GATEWAY: &str = r#"
upstreams:
  - id: users-svc
    targets: [{host: "10.0.0.1", port: 8080}]
  - id: orders-svc
    targets: [{host: "10.0.1.1", port: 8080}]
  - id: admin-svc
    targets: [{host: "10.0.2.1", port: 8080}]
routes:
  - id: catch-all
    priority: -10
    paths: [{type: prefix, value: /}]
    upstream_id: users-svc
  - id: users
    paths: [{type: prefix, value: /api/users}]
    upstream_id: users-svc
  - id: user-by-id
    paths: [{type: regex, value: "^/api/users/[0-9]+$"}]
    upstream_id: users-svc
  - id: users-index
    paths: [{type: exact, value: /api/users}]
    upstream_id: users-svc
  - id: orders
    methods: [GET, POST]
    paths: [{type: prefix, value: /api/orders}]
    upstream_id: orders-svc
  - id: admin
    hosts: ["admin.example.com"]
    headers: [{name: x-admin-token}]
    paths: [{type: prefix, value: /api}]
    priority: 500
    upstream_id: admin-svc
"#;

#[test]
fn test_specificity_ladder() {
    let r = router(API_GATEWAY);
    // exact beats regex beats prefix at equal priority
    assert_eq!(r.match_route("GET", "/api/users", None, &[]).unwrap().id, "users-index");
    assert_eq!(r.match_route("GET", "/api/users/42", None, &[]).unwrap().id, "user-by-id");
    assert_eq!(
        r.match_route("GET", "/api/users/42/posts", None, &[]).unwrap().id,
        "users"
    );
    assert_eq!(r.match_route("GET", "/totally/else", None, &[]).unwrap().id, "catch-all");
}

#[test]
fn test_high_priority_route_needs_all_predicates() {
    let r = router(API_GATEWAY);
    // Priority 500 admin route only wins when host + header match
    let m = r
        .match_route(
            "GET",
            "/api/users",
            Some("admin.example.com"),
            &[("x-admin-token", "t")],
        )
        .unwrap();
    assert_eq!(m.id, "admin");

    // Missing header predicate: falls through to the ordinary ladder
    let m = r
        .match_route("GET", "/api/users", Some("admin.example.com"), &[])
        .unwrap();
    assert_eq!(m.id, "users-index");
}

#[test]
fn test_method_constraint() {
    let r = router(API_GATEWAY);
    assert_eq!(r.match_route("POST", "/api/orders/7", None, &[]).unwrap().id, "orders");
    // DELETE is not allowed on orders; the catch-all takes it
    assert_eq!(
        r.match_route("DELETE", "/api/orders/7", None, &[]).unwrap().id,
        "catch-all"
    );
}

#[test]
fn test_encoded_path_is_matched_decoded() {
    let r = router(API_GATEWAY);
    let decoded = percent_decode_path("/api%2Fusers");
    assert_eq!(decoded, "/api/users");
    assert_eq!(r.match_route("GET", &decoded, None, &[]).unwrap().id, "users-index");
}

#[test]
fn test_snapshot_replacement_is_atomic_per_request() {
    // After S2 is published no new request observes S1's routes, while a
    // request holding S1 still resolves against S1.
    let s1 = snapshot(API_GATEWAY, 1);
    let r = Router::new();
    r.reload(CompiledRouter::build(&s1).unwrap());
    let v1 = r.version();

    let s2 = snapshot(
        r#"
upstreams:
  - id: users-svc
    targets: [{host: "10.0.0.1", port: 8080}]
routes:
  - id: only-health
    paths: [{type: exact, value: /health}]
    upstream_id: users-svc
"#,
        2,
    );
    r.reload(CompiledRouter::build(&s2).unwrap());

    assert!(r.version() > v1);
    assert!(r.match_route("GET", "/api/users", None, &[]).is_none());
    assert_eq!(r.match_route("GET", "/health", None, &[]).unwrap().id, "only-health");

    // The old snapshot object itself is untouched for in-flight holders
    assert_eq!(s1.routes.len(), 6);
}

#[test]
fn test_rejected_snapshot_never_compiles() {
    let state: GatewayState = serde_yaml::from_str(
        r#"
upstreams:
  - id: u
    targets: [{host: a, port: 80}]
routes:
  - id: bad
    paths: [{type: regex, value: "(unclosed"}]
    upstream_id: u
"#,
    )
    .unwrap();
    assert!(ConfigSnapshot::from_state(state, 1).is_err());
}
