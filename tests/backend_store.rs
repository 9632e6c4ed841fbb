use std::sync::Arc;

use switchyard::{
    BackendError, BackendStore, InMemoryKvStore, KvStore, default_registry,
    core::model::{
        Endpoint, Host, Listener, Location, LocationKey, LocationOptions, MiddlewareInstance,
        Upstream, UpstreamOptions,
    },
    plugins::{connlimit::ConnLimit, ratelimit::RateLimit},
    ports::kv_store::SetOptions,
};

fn store() -> BackendStore {
    BackendStore::new(
        Arc::new(InMemoryKvStore::new()),
        Arc::new(default_registry().unwrap()),
        "/switchyard",
    )
}

fn rate_limit(id: &str, requests: i64) -> MiddlewareInstance {
    let rl = RateLimit::new(1, requests, 10, "client.ip", "").unwrap();
    MiddlewareInstance::new(id, "ratelimit", Arc::new(rl)).unwrap()
}

fn conn_limit(id: &str) -> MiddlewareInstance {
    let cl = ConnLimit::new(10, "client.ip").unwrap();
    MiddlewareInstance::new(id, "connlimit", Arc::new(cl)).unwrap()
}

async fn seed(store: &BackendStore) {
    store.add_upstream(Upstream::new("up1").unwrap()).await.unwrap();
    store
        .add_endpoint(Endpoint::new("up1", "e1", "http://localhost:5000").unwrap())
        .await
        .unwrap();
    store.add_host(Host::new("localhost").unwrap()).await.unwrap();
    store
        .add_location(Location::new("localhost", "loc1", "/home", "up1").unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_upstream_crud() {
    let store = store();
    assert!(store.get_upstreams().await.unwrap().is_empty());

    let up = store.add_upstream(Upstream::new("up1").unwrap()).await.unwrap();
    assert_eq!(up.id, "up1");
    assert!(up.endpoints.is_empty());

    assert!(matches!(
        store.add_upstream(Upstream::new("up1").unwrap()).await,
        Err(BackendError::AlreadyExists { .. })
    ));

    let e = store
        .add_endpoint(Endpoint::new("up1", "e1", "http://localhost:5000").unwrap())
        .await
        .unwrap();
    let up = store.get_upstream("up1").await.unwrap();
    assert_eq!(up.endpoints, vec![e]);

    let options = UpstreamOptions {
        timeouts: switchyard::core::model::UpstreamTimeouts {
            read: "10s".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let up = store
        .update_upstream_options("up1", options.clone())
        .await
        .unwrap();
    assert_eq!(up.options, options);
    assert_eq!(up.endpoints.len(), 1);

    store.delete_endpoint("up1", "e1").await.unwrap();
    assert!(store.get_upstream("up1").await.unwrap().endpoints.is_empty());
    assert!(store.delete_endpoint("up1", "e1").await.unwrap_err().is_not_found());

    store.delete_upstream("up1").await.unwrap();
    assert!(store.get_upstream("up1").await.unwrap_err().is_not_found());
    assert!(store.delete_upstream("up1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_add_upstream_with_endpoints() {
    let store = store();
    let mut up = Upstream::new("up1").unwrap();
    up.endpoints = vec![
        Endpoint::new("up1", "e1", "http://localhost:5000").unwrap(),
        Endpoint::new("up1", "e2", "http://localhost:5001").unwrap(),
    ];
    let stored = store.add_upstream(up.clone()).await.unwrap();
    assert_eq!(stored, up);
}

#[tokio::test]
async fn test_bad_upstream_options_are_rejected() {
    let store = store();
    store.add_upstream(Upstream::new("up1").unwrap()).await.unwrap();
    let mut options = UpstreamOptions::default();
    options.timeouts.dial = "soon".to_string();
    assert!(matches!(
        store.update_upstream_options("up1", options).await,
        Err(BackendError::Validation(_))
    ));
}

#[tokio::test]
async fn test_endpoint_requires_upstream() {
    let store = store();
    let err = store
        .add_endpoint(Endpoint::new("missing", "e1", "http://localhost:5000").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::ReferentialIntegrity { .. }));
}

#[tokio::test]
async fn test_host_crud() {
    let store = store();
    let host = store.add_host(Host::new("localhost").unwrap()).await.unwrap();
    assert_eq!(host.name, "localhost");
    assert!(host.locations.is_empty());
    assert!(host.key_pair.is_none());

    assert!(matches!(
        store.add_host(Host::new("localhost").unwrap()).await,
        Err(BackendError::AlreadyExists { .. })
    ));

    let listener = Listener::new("l1", "http", "tcp", "127.0.0.1:8080").unwrap();
    store.add_host_listener("localhost", listener.clone()).await.unwrap();
    let host = store.get_host("localhost").await.unwrap();
    assert_eq!(host.listeners, vec![listener]);

    store.delete_host_listener("localhost", "l1").await.unwrap();
    assert!(store.get_host("localhost").await.unwrap().listeners.is_empty());

    assert_eq!(store.get_hosts().await.unwrap().len(), 1);
    store.delete_host("localhost").await.unwrap();
    assert!(store.get_host("localhost").await.unwrap_err().is_not_found());
    assert!(store.get_hosts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_listener_requires_host() {
    let store = store();
    let listener = Listener::new("l1", "http", "tcp", "127.0.0.1:8080").unwrap();
    assert!(matches!(
        store.add_host_listener("nowhere", listener).await,
        Err(BackendError::ReferentialIntegrity { .. })
    ));
}

#[tokio::test]
async fn test_location_crud() {
    let store = store();
    seed(&store).await;

    let location = store.get_location("localhost", "loc1").await.unwrap();
    assert_eq!(location.path, "/home");
    assert_eq!(location.upstream.id, "up1");
    assert_eq!(location.upstream.endpoints.len(), 1);

    let host = store.get_host("localhost").await.unwrap();
    assert_eq!(host.locations, vec![location]);

    let location = store
        .update_location_path("localhost", "loc1", "/away")
        .await
        .unwrap();
    assert_eq!(location.path, "/away");

    store.add_upstream(Upstream::new("up2").unwrap()).await.unwrap();
    let location = store
        .update_location_upstream("localhost", "loc1", "up2")
        .await
        .unwrap();
    assert_eq!(location.upstream.id, "up2");

    let mut options = LocationOptions::default();
    options.limits.max_body_bytes = 1024;
    options.failover_predicate = "IsNetworkError && AttemptsLe(2)".to_string();
    let location = store
        .update_location_options("localhost", "loc1", options.clone())
        .await
        .unwrap();
    assert_eq!(location.options, options);
    assert!(location.parsed_options().unwrap().failover_predicate.is_some());

    store.delete_location("localhost", "loc1").await.unwrap();
    assert!(store
        .get_location("localhost", "loc1")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .delete_location("localhost", "loc1")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_location_referential_integrity() {
    let store = store();
    store.add_upstream(Upstream::new("up1").unwrap()).await.unwrap();

    // Missing host
    let err = store
        .add_location(Location::new("localhost", "loc1", "/home", "up1").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::ReferentialIntegrity { .. }));

    // Missing upstream
    store.add_host(Host::new("localhost").unwrap()).await.unwrap();
    let err = store
        .add_location(Location::new("localhost", "loc1", "/home", "nope").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::ReferentialIntegrity { .. }));

    store
        .add_location(Location::new("localhost", "loc1", "/home", "up1").unwrap())
        .await
        .unwrap();
    let err = store
        .update_location_upstream("localhost", "loc1", "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::ReferentialIntegrity { .. }));

    // An upstream in use cannot be deleted
    let err = store.delete_upstream("up1").await.unwrap_err();
    assert!(matches!(err, BackendError::ReferentialIntegrity { .. }));
    assert_eq!(
        store.upstream_references("up1").await.unwrap(),
        vec![LocationKey {
            hostname: "localhost".to_string(),
            id: "loc1".to_string(),
        }]
    );

    store.delete_location("localhost", "loc1").await.unwrap();
    store.delete_upstream("up1").await.unwrap();
}

#[tokio::test]
async fn test_duplicate_location_is_rejected() {
    let store = store();
    seed(&store).await;
    assert!(matches!(
        store
            .add_location(Location::new("localhost", "loc1", "/other", "up1").unwrap())
            .await,
        Err(BackendError::AlreadyExists { .. })
    ));
}

#[tokio::test]
async fn test_middleware_priorities() {
    let store = store();
    seed(&store).await;

    let first = store
        .add_location_middleware("localhost", "loc1", rate_limit("rl1", 10))
        .await
        .unwrap();
    let second = store
        .add_location_middleware("localhost", "loc1", conn_limit("cl1"))
        .await
        .unwrap();
    let third = store
        .add_location_middleware("localhost", "loc1", rate_limit("rl2", 20))
        .await
        .unwrap();
    assert_eq!(
        (first.priority, second.priority, third.priority),
        (0, 1, 2)
    );

    let location = store.get_location("localhost", "loc1").await.unwrap();
    let ids: Vec<_> = location.middlewares.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["rl1", "cl1", "rl2"]);

    store
        .delete_location_middleware("localhost", "loc1", "ratelimit", "rl1")
        .await
        .unwrap();
    let location = store.get_location("localhost", "loc1").await.unwrap();
    let chain: Vec<_> = location
        .middlewares
        .iter()
        .map(|m| (m.id.as_str(), m.priority))
        .collect();
    assert_eq!(chain, vec![("cl1", 0), ("rl2", 1)]);

    let stored = store
        .get_location_middleware("localhost", "loc1", "ratelimit", "rl2")
        .await
        .unwrap();
    assert_eq!(stored.priority, 1);
}

#[tokio::test]
async fn test_middleware_update_keeps_priority() {
    let store = store();
    seed(&store).await;
    store
        .add_location_middleware("localhost", "loc1", rate_limit("rl1", 10))
        .await
        .unwrap();
    store
        .add_location_middleware("localhost", "loc1", rate_limit("rl2", 10))
        .await
        .unwrap();

    let mut updated = rate_limit("rl2", 99);
    updated.priority = 7;
    let stored = store
        .update_location_middleware("localhost", "loc1", updated)
        .await
        .unwrap();
    assert_eq!(stored.priority, 1);

    let read = store
        .get_location_middleware("localhost", "loc1", "ratelimit", "rl2")
        .await
        .unwrap();
    assert_eq!(read, rate_limit_with_priority("rl2", 99, 1));
}

fn rate_limit_with_priority(id: &str, requests: i64, priority: usize) -> MiddlewareInstance {
    MiddlewareInstance {
        priority,
        ..rate_limit(id, requests)
    }
}

#[tokio::test]
async fn test_middleware_errors() {
    let store = store();
    seed(&store).await;
    store
        .add_location_middleware("localhost", "loc1", rate_limit("rl1", 10))
        .await
        .unwrap();

    assert!(matches!(
        store
            .add_location_middleware("localhost", "loc1", rate_limit("rl1", 10))
            .await,
        Err(BackendError::AlreadyExists { .. })
    ));
    assert!(store
        .add_location_middleware("localhost", "missing", rate_limit("rl2", 10))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .get_location_middleware("localhost", "loc1", "ratelimit", "nope")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .update_location_middleware("localhost", "loc1", rate_limit("nope", 10))
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_unregistered_middleware_type() {
    let store = store();
    seed(&store).await;

    let rl = RateLimit::new(1, 10, 10, "client.ip", "").unwrap();
    let unknown = MiddlewareInstance::new("m1", "auth", Arc::new(rl)).unwrap();

    let not_found = |err: BackendError| {
        matches!(
            err,
            BackendError::NotFound {
                entity: "middleware type",
                ..
            }
        )
    };
    assert!(not_found(
        store
            .add_location_middleware("localhost", "loc1", unknown.clone())
            .await
            .unwrap_err()
    ));
    assert!(not_found(
        store
            .update_location_middleware("localhost", "loc1", unknown)
            .await
            .unwrap_err()
    ));
    assert!(not_found(
        store
            .get_location_middleware("localhost", "loc1", "auth", "m1")
            .await
            .unwrap_err()
    ));
    assert!(not_found(
        store
            .delete_location_middleware("localhost", "loc1", "auth", "m1")
            .await
            .unwrap_err()
    ));
}

#[tokio::test]
async fn test_host_with_locations_round_trip() {
    let store = store();
    store.add_upstream(Upstream::new("up1").unwrap()).await.unwrap();

    let mut location = Location::new("localhost", "loc1", "/home", "up1").unwrap();
    location.middlewares = vec![rate_limit("rl1", 10), conn_limit("cl1")];
    let mut host = Host::new("localhost").unwrap();
    host.listeners = vec![Listener::new("l1", "https", "tcp", "0.0.0.0:443").unwrap()];
    host.locations = vec![location];

    let stored = store.add_host(host).await.unwrap();
    assert_eq!(stored.listeners.len(), 1);
    assert_eq!(stored.locations.len(), 1);

    let location = &stored.locations[0];
    assert_eq!(location.upstream, store.get_upstream("up1").await.unwrap());
    let chain: Vec<_> = location
        .middlewares
        .iter()
        .map(|m| (m.id.as_str(), m.type_name.as_str(), m.priority))
        .collect();
    assert_eq!(chain, vec![("rl1", "ratelimit", 0), ("cl1", "connlimit", 1)]);

    assert_eq!(store.get_host("localhost").await.unwrap(), stored);
}

#[tokio::test]
async fn test_failed_add_host_leaves_nothing_behind() {
    let store = store();
    let mut host = Host::new("localhost").unwrap();
    host.listeners = vec![Listener::new("l1", "http", "tcp", "127.0.0.1:8080").unwrap()];
    host.locations = vec![Location::new("localhost", "loc1", "/home", "missing").unwrap()];

    let err = store.add_host(host.clone()).await.unwrap_err();
    assert!(matches!(err, BackendError::ReferentialIntegrity { .. }));
    assert!(store.get_host("localhost").await.unwrap_err().is_not_found());
    assert!(store.get_hosts().await.unwrap().is_empty());

    // Nothing blocks a retry once the upstream exists.
    store.add_upstream(Upstream::new("missing").unwrap()).await.unwrap();
    let stored = store.add_host(host).await.unwrap();
    assert_eq!(stored.locations.len(), 1);
    assert_eq!(stored.listeners.len(), 1);
}

#[tokio::test]
async fn test_add_host_rejects_duplicate_children() {
    let store = store();
    store.add_upstream(Upstream::new("up1").unwrap()).await.unwrap();

    let mut host = Host::new("localhost").unwrap();
    let listener = Listener::new("l1", "http", "tcp", "127.0.0.1:8080").unwrap();
    host.listeners = vec![listener.clone(), listener];
    assert!(matches!(
        store.add_host(host).await,
        Err(BackendError::AlreadyExists {
            entity: "listener",
            ..
        })
    ));

    let mut host = Host::new("localhost").unwrap();
    let location = Location::new("localhost", "loc1", "/home", "up1").unwrap();
    host.locations = vec![location.clone(), location];
    assert!(matches!(
        store.add_host(host).await,
        Err(BackendError::AlreadyExists {
            entity: "location",
            ..
        })
    ));
    assert!(store.get_host("localhost").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_failed_add_location_leaves_nothing_behind() {
    let store = store();
    seed(&store).await;

    let mut location = Location::new("localhost", "loc2", "/api", "up1").unwrap();
    location.middlewares = vec![rate_limit("rl1", 10), rate_limit("rl1", 20)];
    assert!(matches!(
        store.add_location(location).await,
        Err(BackendError::AlreadyExists {
            entity: "middleware",
            ..
        })
    ));
    assert!(store
        .get_location("localhost", "loc2")
        .await
        .unwrap_err()
        .is_not_found());

    let mut location = Location::new("localhost", "loc2", "/api", "up1").unwrap();
    location.middlewares = vec![rate_limit("rl1", 10), rate_limit("rl2", 20)];
    let stored = store.add_location(location).await.unwrap();
    assert_eq!(stored.middlewares.len(), 2);
}

#[tokio::test]
async fn test_add_location_rolls_back_a_failed_write() {
    let kv = Arc::new(InMemoryKvStore::new());
    let store = BackendStore::new(kv.clone(), Arc::new(default_registry().unwrap()), "/switchyard");
    seed(&store).await;

    // A stray key left by external tooling collides with the middleware write.
    let stray = store.keys().middleware("localhost", "loc2", "ratelimit", "rl1");
    kv.set(&stray, "{}", SetOptions::default()).await.unwrap();

    let mut location = Location::new("localhost", "loc2", "/api", "up1").unwrap();
    location.middlewares = vec![rate_limit("rl1", 10)];
    assert!(matches!(
        store.add_location(location.clone()).await,
        Err(BackendError::AlreadyExists { .. })
    ));
    assert!(store
        .get_location("localhost", "loc2")
        .await
        .unwrap_err()
        .is_not_found());

    let stored = store.add_location(location).await.unwrap();
    assert_eq!(stored.middlewares[0].id, "rl1");
}

#[tokio::test]
async fn test_snapshot_reads_everything() {
    let store = store();
    seed(&store).await;
    store.add_upstream(Upstream::new("idle").unwrap()).await.unwrap();

    let snapshot = store.snapshot().await.unwrap();
    assert!(snapshot.index > 0);
    let ids: Vec<_> = snapshot.upstreams.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, vec!["idle", "up1"]);
    assert_eq!(snapshot.hosts.len(), 1);
    assert_eq!(snapshot.hosts[0].locations[0].upstream.endpoints.len(), 1);
}

#[tokio::test]
async fn test_custom_prefix_isolates_trees() {
    let kv = Arc::new(InMemoryKvStore::new());
    let registry = Arc::new(default_registry().unwrap());
    let a = BackendStore::new(kv.clone(), registry.clone(), "/a");
    let b = BackendStore::new(kv, registry, "/b/");

    a.add_upstream(Upstream::new("up1").unwrap()).await.unwrap();
    assert!(b.get_upstreams().await.unwrap().is_empty());
    assert_eq!(b.keys().root(), "/b");
}
