//! End-to-end dispatch scenarios driven through the in-process runtime.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tool_gateway::catalog::{BackendRef, CatalogDescriptor, ToolDescriptor};
use tool_gateway::reaper::{IdleReaper, ReaperConfig};
use tool_gateway::runtime::{handler, LocalCall, LocalRuntime};
use tool_gateway::secrets::InMemorySecretStore;
use tool_gateway::supervisor::InstanceState;
use tool_gateway::{Config, Error, Gateway};

fn docker() -> BackendRef {
    BackendRef::image("tools/docker")
}

fn infra_catalog() -> CatalogDescriptor {
    CatalogDescriptor::new(
        "infra",
        vec![
            ToolDescriptor::new("docker-ps", docker()),
            ToolDescriptor::new("hang", docker()),
            ToolDescriptor::new("die", docker()),
        ],
    )
}

fn docker_runtime() -> Arc<LocalRuntime> {
    let runtime = Arc::new(LocalRuntime::new());
    runtime.register(
        docker(),
        handler(|call: LocalCall| async move {
            match call.tool.as_str() {
                "docker-ps" => Ok(json!({
                    "content": [{ "type": "text", "text": "CONTAINER ID   IMAGE" }]
                })),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!({}))
                }
                "die" => Err(Error::backend_unavailable("backend stdout closed")),
                other => Err(Error::tool_failed(format!("unknown tool {}", other))),
            }
        }),
    );
    runtime
}

fn gateway(runtime: Arc<LocalRuntime>, catalogs: Vec<CatalogDescriptor>) -> Arc<Gateway> {
    let mut config = Config::default();
    config.supervisor.start_backoff = Duration::from_millis(1);
    config.supervisor.probe_backoff = Duration::from_millis(1);
    Arc::new(
        Gateway::with_catalogs(config, runtime, Arc::new(InMemorySecretStore::new()), catalogs)
            .unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_spawn_reuse_idle_drain_respawn() {
    let runtime = docker_runtime();
    let gw = gateway(runtime.clone(), vec![infra_catalog()]);
    let infra = gw.endpoint("infra");
    let reaper = IdleReaper::new(
        gw.supervisor().clone(),
        ReaperConfig {
            interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
        },
    );

    let first = infra.call("docker-ps", json!({}), None).await.unwrap();
    assert_eq!(runtime.spawn_count(), 1);
    assert!(first.content["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("CONTAINER"));

    let second = infra.call("docker-ps", json!({}), None).await.unwrap();
    assert_eq!(second.instance_id, first.instance_id);
    assert_eq!(runtime.spawn_count(), 1);

    let instance = gw.supervisor().live_instances().pop().unwrap();
    assert_eq!(instance.state(), InstanceState::Healthy);

    tokio::time::advance(Duration::from_secs(61)).await;
    let stats = reaper.run_cycle();
    assert_eq!(stats.drained, 1);
    assert_eq!(instance.state(), InstanceState::Stopped);
    assert!(gw.supervisor().instances().is_empty());

    let third = infra.call("docker-ps", json!({}), None).await.unwrap();
    assert_ne!(third.instance_id, first.instance_id);
    assert_eq!(runtime.spawn_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_callers_share_one_spawn() {
    let runtime = docker_runtime();
    runtime.set_spawn_delay(&docker(), Duration::from_millis(50));
    let gw = gateway(runtime.clone(), vec![infra_catalog()]);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let gw = gw.clone();
        tasks.push(tokio::spawn(async move {
            gw.dispatcher()
                .dispatch("infra", "docker-ps", json!({}), None)
                .await
                .unwrap()
                .instance_id
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }

    assert_eq!(runtime.spawn_count(), 1);
    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(gw.supervisor().instances()[0].in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_releases_once_and_keeps_instance() {
    let runtime = docker_runtime();
    let gw = gateway(runtime.clone(), vec![infra_catalog()]);
    let infra = gw.endpoint("infra");

    let err = infra
        .call("hang", json!({}), Some(Duration::from_millis(500)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let listed = gw.supervisor().instances();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].in_flight, 0);
    assert_eq!(listed[0].state, InstanceState::Healthy);

    let next = infra.call("docker-ps", json!({}), None).await.unwrap();
    assert_eq!(next.instance_id.as_str(), listed[0].instance_id);
    assert_eq!(runtime.spawn_count(), 1);
}

#[tokio::test]
async fn test_crash_fails_in_flight_callers_without_respawn() {
    let runtime = docker_runtime();
    let gw = gateway(runtime.clone(), vec![infra_catalog()]);

    let waiter = {
        let gw = gw.clone();
        tokio::spawn(async move {
            gw.dispatcher()
                .dispatch("infra", "hang", json!({}), Some(Duration::from_secs(60)))
                .await
        })
    };
    while gw.supervisor().instances().first().map(|i| i.in_flight) != Some(1) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let crashed_id = gw.supervisor().instances()[0].instance_id.clone();

    let err = gw
        .dispatcher()
        .dispatch("infra", "die", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));

    let err = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("in-flight caller should be woken")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));

    // No silent respawn: nothing runs until the next request.
    assert!(gw.supervisor().instances().is_empty());
    assert_eq!(runtime.spawn_count(), 1);

    let next = gw
        .dispatcher()
        .dispatch("infra", "docker-ps", json!({}), None)
        .await
        .unwrap();
    assert_ne!(next.instance_id.as_str(), crashed_id);
    assert_eq!(runtime.spawn_count(), 2);
}

#[tokio::test]
async fn test_same_backend_isolated_per_catalog() {
    let runtime = docker_runtime();
    let ops = CatalogDescriptor::new("ops", vec![ToolDescriptor::new("docker-ps", docker())]);
    let gw = gateway(runtime.clone(), vec![infra_catalog(), ops]);

    let a = gw.endpoint("infra").call("docker-ps", json!({}), None).await.unwrap();
    let b = gw.endpoint("ops").call("docker-ps", json!({}), None).await.unwrap();
    assert_ne!(a.instance_id, b.instance_id);
    assert_eq!(runtime.spawn_count(), 2);
}

#[tokio::test]
async fn test_missing_secret_spawns_nothing() {
    let runtime = docker_runtime();
    let catalog = CatalogDescriptor::new(
        "dev",
        vec![ToolDescriptor::new("docker-ps", docker()).with_secrets(&["REGISTRY_TOKEN"])],
    );
    let gw = gateway(runtime.clone(), vec![catalog]);

    let err = gw
        .endpoint("dev")
        .call("docker-ps", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.to_ipc_error_code(), "SECRET_RESOLUTION_FAILED");
    assert_eq!(runtime.spawn_count(), 0);
}

#[tokio::test]
async fn test_reload_swaps_catalogs_for_new_requests() {
    let runtime = docker_runtime();
    let gw = gateway(runtime.clone(), vec![infra_catalog()]);

    let bad = CatalogDescriptor::new("infra", vec![ToolDescriptor::new("docker-ps", BackendRef::image(""))]);
    assert!(gw.reload(vec![bad]).is_err());
    gw.endpoint("infra").call("docker-ps", json!({}), None).await.unwrap();

    let ops = CatalogDescriptor::new("ops", vec![ToolDescriptor::new("docker-ps", docker())]);
    gw.reload(vec![ops]).unwrap();
    let err = gw
        .endpoint("infra")
        .call("docker-ps", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownCatalog(_)));
    gw.endpoint("ops").call("docker-ps", json!({}), None).await.unwrap();
}

#[tokio::test]
async fn test_tools_sharing_backend_launch_with_their_own_secrets() {
    let runtime = docker_runtime();
    let catalog = CatalogDescriptor::new(
        "dev",
        vec![
            ToolDescriptor::new("docker-ps", docker()),
            ToolDescriptor::new("hang", docker()).with_secrets(&["REGISTRY_TOKEN"]),
        ],
    );
    let gw = gateway(runtime.clone(), vec![catalog]);
    let dev = gw.endpoint("dev");

    dev.call("docker-ps", json!({}), None).await.unwrap();
    let err = dev.call("hang", json!({}), None).await.unwrap_err();
    assert_eq!(err.to_ipc_error_code(), "SECRET_RESOLUTION_FAILED");
    assert_eq!(runtime.spawn_count(), 1);
    assert_eq!(gw.supervisor().instances().len(), 1);
}
