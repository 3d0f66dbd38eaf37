#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::StreamExt;
use keel_core::{ObjectKey, Resource, ResourceKind, StoreError, TransportError};
use keel_store::{DeleteParams, ListParams, PropagationPolicy, ResourceClient};
use keel_transport::{Fault, MemoryApiServer, Verb};
use serde_json::json;

fn widgets() -> ResourceKind { ResourceKind::custom("example.dev", "v1", "Widget", "widgets", true) }

fn widget(name: &str, replicas: i64) -> Resource {
    Resource::new(&widgets(), "default", name).with_spec(json!({ "replicas": replicas }))
}

fn setup() -> (Arc<MemoryApiServer>, ResourceClient) {
    let srv = Arc::new(MemoryApiServer::new());
    let client = ResourceClient::new(srv.clone(), widgets());
    (srv, client)
}

#[tokio::test]
async fn create_then_get_returns_same_spec() {
    let (_srv, client) = setup();
    let created = client.create(&widget("demo", 3)).await.unwrap();
    assert_eq!(created.resource_version(), Some("1"));
    assert_eq!(created.api_version, "example.dev/v1");

    let fetched = client.get("default", "demo").await.unwrap();
    assert_eq!(fetched.spec, Some(json!({ "replicas": 3 })));
    assert_eq!(fetched.resource_version(), Some("1"));
    assert_eq!(fetched.metadata.uid, created.metadata.uid);

    let dup = client.create(&widget("demo", 4)).await.unwrap_err();
    assert_eq!(dup, StoreError::AlreadyExists(ObjectKey::new("Widget", "default", "demo")));
}

#[tokio::test]
async fn stale_update_conflicts_until_reread() {
    let (_srv, client) = setup();
    let v1 = client.create(&widget("demo", 1)).await.unwrap();

    let mut first = v1.clone();
    first.spec = Some(json!({ "replicas": 2 }));
    let v2 = client.update(&first).await.unwrap();
    assert_eq!(v2.resource_version(), Some("2"));

    let mut stale = v1.clone();
    stale.spec = Some(json!({ "replicas": 5 }));
    let err = client.update(&stale).await.unwrap_err();
    assert!(err.is_conflict(), "{err:?}");

    let mut fresh = client.get("default", "demo").await.unwrap();
    assert_eq!(fresh.resource_version(), Some("2"));
    fresh.spec = Some(json!({ "replicas": 5 }));
    let v3 = client.update(&fresh).await.unwrap();
    assert_eq!(v3.resource_version(), Some("3"));
    assert_eq!(v3.spec, Some(json!({ "replicas": 5 })));
}

#[tokio::test]
async fn concurrent_writers_on_same_version_one_wins() {
    let (srv, a) = setup();
    let b = ResourceClient::new(srv.clone(), widgets());
    let base = a.create(&widget("demo", 1)).await.unwrap();

    let mut from_a = base.clone();
    from_a.spec = Some(json!({ "replicas": 2 }));
    let mut from_b = base.clone();
    from_b.spec = Some(json!({ "replicas": 7 }));

    let (ra, rb) = tokio::join!(a.update(&from_a), b.update(&from_b));
    let wins = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(wins, 1);
    let loser = if ra.is_err() { ra.unwrap_err() } else { rb.unwrap_err() };
    assert!(loser.is_conflict());
    assert_eq!(srv.revision(), 2);
}

#[tokio::test]
async fn delete_twice_is_not_found() {
    let (_srv, client) = setup();
    client.create(&widget("demo", 1)).await.unwrap();
    client.delete("default", "demo").await.unwrap();
    let err = client.delete("default", "demo").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(client.get("default", "demo").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn delete_with_options_is_accepted() {
    let (_srv, client) = setup();
    client.create(&widget("demo", 1)).await.unwrap();
    let params = DeleteParams { propagation_policy: Some(PropagationPolicy::Background), grace_period_seconds: Some(0) };
    client.delete_with("default", "demo", &params).await.unwrap();
    assert!(client.get("default", "demo").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn merge_patch_updates_without_version() {
    let (_srv, client) = setup();
    client.create(&widget("demo", 1)).await.unwrap();
    let patched = client.patch("default", "demo", &json!({ "spec": { "paused": true } })).await.unwrap();
    assert_eq!(patched.spec, Some(json!({ "replicas": 1, "paused": true })));
    assert_eq!(patched.resource_version(), Some("2"));
    assert!(client.patch("default", "demo", &json!([1, 2])).await.unwrap_err().to_string().contains("merge patch"));
}

#[tokio::test]
async fn listing_is_lazy_paged_and_restartable() {
    let (srv, client) = setup();
    for i in 0..5 {
        client.create(&widget(&format!("w{i}"), i)).await.unwrap();
    }
    let client = client.with_page_size(2);
    let listing = client.list("default");
    assert_eq!(srv.request_count(Verb::List), 0);

    let mut stream = listing.stream();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.name(), "w0");
    assert_eq!(first.kind, "Widget");
    assert_eq!(srv.request_count(Verb::List), 1);
    drop(stream);

    let all = listing.collect().await.unwrap();
    let names: Vec<_> = all.iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["w0", "w1", "w2", "w3", "w4"]);
    assert_eq!(srv.request_count(Verb::List), 4);

    let again = listing.collect().await.unwrap();
    assert_eq!(again.len(), 5);
}

#[tokio::test]
async fn list_filters_by_label_and_namespace() {
    let (_srv, client) = setup();
    client.create(&widget("plain", 1)).await.unwrap();
    client.create(&widget("gold", 1).with_label("tier", "gold")).await.unwrap();
    let mut other = widget("gold", 1).with_label("tier", "gold");
    other.metadata.namespace = Some("prod".into());
    client.create(&other).await.unwrap();

    let gold = client.list_with("", ListParams::labels("tier=gold")).collect().await.unwrap();
    assert_eq!(gold.len(), 2);
    let default_only = client.list("default").collect().await.unwrap();
    assert_eq!(default_only.len(), 2);
}

#[tokio::test]
async fn invalid_requests_fail_before_the_network() {
    let (srv, client) = setup();
    let with_rv = {
        let mut w = widget("demo", 1);
        w.metadata.resource_version = Some("9".into());
        w
    };
    assert!(matches!(client.create(&with_rv).await, Err(StoreError::Validation(_))));
    assert!(matches!(client.update(&widget("demo", 1)).await, Err(StoreError::Validation(_))));

    let pod = Resource::new(&ResourceKind::pod(), "default", "web");
    assert!(matches!(client.create(&pod).await, Err(StoreError::Validation(_))));

    let mut no_ns = widget("demo", 1);
    no_ns.metadata.namespace = None;
    assert!(matches!(client.create(&no_ns).await, Err(StoreError::Validation(_))));
    assert!(matches!(client.get("", "demo").await, Err(StoreError::Validation(_))));

    assert!(matches!(client.get("default", "").await, Err(StoreError::Validation(_))));
    assert!(matches!(client.patch("default", "", &json!({ "spec": {} })).await, Err(StoreError::Validation(_))));
    assert!(matches!(client.delete_with("default", "", &DeleteParams::default()).await, Err(StoreError::Validation(_))));

    for verb in [Verb::Create, Verb::Update, Verb::Get, Verb::List, Verb::Patch, Verb::Delete] {
        assert_eq!(srv.request_count(verb), 0, "{verb:?}");
    }
}

#[tokio::test]
async fn server_side_validation_is_reported() {
    let (_srv, client) = setup();
    let err = client.create(&widget("Bad_Name", 1)).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)), "{err:?}");
}

#[tokio::test]
async fn transport_failures_surface_unchanged() {
    let (srv, client) = setup();
    srv.fail_next(Verb::Get, Fault::Transport(TransportError::Unreachable("connection refused".into())));
    let err = client.get("default", "demo").await.unwrap_err();
    assert_eq!(err, StoreError::Transport(TransportError::Unreachable("connection refused".into())));
    assert!(err.is_retryable());

    srv.fail_next(Verb::Create, Fault::Status(503));
    let err = client.create(&widget("demo", 1)).await.unwrap_err();
    assert!(matches!(err, StoreError::Unexpected { status: 503, .. }));
}

#[tokio::test]
async fn rejected_credentials_are_not_retryable() {
    let (srv, client) = setup();
    srv.fail_next(Verb::Get, Fault::Status(403));
    let err = client.get("default", "demo").await.unwrap_err();
    assert!(matches!(err, StoreError::Transport(TransportError::Unauthorized(_))), "{err:?}");
    assert!(!err.is_retryable());

    srv.fail_next(Verb::Create, Fault::Status(401));
    let err = client.create(&widget("demo", 1)).await.unwrap_err();
    assert!(matches!(err, StoreError::Transport(TransportError::Unauthorized(_))), "{err:?}");
}

#[tokio::test]
async fn cluster_scoped_kinds_ignore_namespace() {
    let srv = Arc::new(MemoryApiServer::new());
    let nodes = ResourceClient::new(srv, ResourceKind::node());
    let mut node = Resource::new(&ResourceKind::node(), "", "worker-1").with_label("zone", "a");
    node.metadata.namespace = Some("default".into());
    let created = nodes.create(&node).await.unwrap();
    assert_eq!(created.namespace(), "");
    assert_eq!(nodes.get("", "worker-1").await.unwrap().metadata.labels["zone"], "a");
    assert_eq!(nodes.list("").collect().await.unwrap().len(), 1);
}
