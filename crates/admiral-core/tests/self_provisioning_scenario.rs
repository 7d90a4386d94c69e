mod common;

use std::sync::Arc;
use std::time::Duration;

use admiral_core::AdmiralConfig;
use admiral_core::app::TaskHost;
use admiral_core::domain::{ServiceTaskCallback, TaskStage};
use admiral_core::impls::{SandboxBehavior, SandboxRequestBroker};
use admiral_core::ports::Query;
use admiral_core::tasks::resources::{
    COMPUTES, CONTAINERS, ComputeState, ContainerState, PowerState, REQUEST_BROKER,
    agent_container_link,
};
use admiral_core::tasks::{SELF_PROVISIONING_FACTORY_LINK, SelfProvisioningTaskService};
use common::{drain_events, eventually, fast_config, link_of, notifications_from, sink};
use serde::Serialize;
use serde_json::{Value, json};

/// Pool the requests below provision into (AWS, us-east-1a).
const POOL_LINK: &str = "/resources/pools/hosts-resource-pool-AWS-us-east-1a";

fn provisioning_host(behavior: SandboxBehavior, config: AdmiralConfig) -> TaskHost {
    TaskHost::builder()
        .config(config)
        .factory(REQUEST_BROKER, Arc::new(SandboxRequestBroker::new(behavior)))
        .task(SelfProvisioningTaskService)
        .build()
        .unwrap()
}

fn request(cluster_size: i64, parent: &str) -> Value {
    json!({
        "endpoint_auth_key": "AKIA",
        "endpoint_auth_private_key": "secret",
        "availability_zone_id": "us-east-1a",
        "security_group": "admiral",
        "endpoint_type": "AWS",
        "compute_instance_type": "t2.micro",
        "cluster_size": cluster_size,
        "service_task_callback": ServiceTaskCallback::create_with_stages(
            parent,
            TaskStage::Finished,
            TaskStage::Failed,
        ),
    })
}

async fn count(host: &TaskHost, factory_link: &str) -> usize {
    host.query(Query::of_kind(factory_link))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap()
        .len()
}

async fn seed<T: Serialize>(host: &TaskHost, factory_link: &str, doc: T) {
    host.post(factory_link, serde_json::to_value(doc).unwrap())
        .await
        .unwrap();
}

async fn parent_stage(host: &TaskHost, parent: &str) -> Value {
    eventually(Duration::from_secs(5), || {
        let host = host.clone();
        let parent = parent.to_string();
        async move { host.get(&parent).await.ok()?.get("stage").cloned() }
    })
    .await
}

#[tokio::test]
async fn zero_cluster_size_provisions_one_host_and_one_container() {
    let host = provisioning_host(SandboxBehavior::default(), fast_config(3));
    let parent = sink(&host, "provisioning-parent").await;

    let created = host
        .post(SELF_PROVISIONING_FACTORY_LINK, request(0, &parent))
        .await
        .unwrap();
    assert_eq!(created["cluster_size"], 1);
    let link = link_of(&created);

    let done = host.wait_for_terminal(&link).await.unwrap();
    assert_eq!(done["task_info"]["stage"], "FINISHED", "{done:#}");
    assert_eq!(done["task_sub_stage"], "COMPLETED");
    assert_eq!(done["compute_resource_links"].as_array().unwrap().len(), 1);
    let containers = done["container_resource_links"].as_array().unwrap();
    assert_eq!(containers.len(), 1);

    assert_eq!(parent_stage(&host, &parent).await, "FINISHED");
    let notified = host.get(&parent).await.unwrap();
    assert_eq!(notified["resource_links"].as_array(), Some(containers));
    assert_eq!(count(&host, COMPUTES).await, 1);
}

#[tokio::test]
async fn second_run_reuses_the_existing_host() {
    let host = provisioning_host(SandboxBehavior::default(), fast_config(3));
    let parent = sink(&host, "rerun-parent").await;

    let mut containers = Vec::new();
    for _ in 0..2 {
        let created = host
            .post(SELF_PROVISIONING_FACTORY_LINK, request(1, &parent))
            .await
            .unwrap();
        let done = host.wait_for_terminal(&link_of(&created)).await.unwrap();
        assert_eq!(done["task_info"]["stage"], "FINISHED", "{done:#}");
        let links: Vec<String> =
            serde_json::from_value(done["container_resource_links"].clone()).unwrap();
        assert_eq!(links.len(), 1);
        containers.extend(links);
    }

    assert_eq!(count(&host, COMPUTES).await, 1);
    // The second run cleared the first run's container off the host.
    assert!(host.get(&containers[0]).await.unwrap_err().is_not_found());
    let current: ContainerState = host.get_as(&containers[1]).await.unwrap();
    assert!(current.parent_link.is_some());
    assert_eq!(count(&host, CONTAINERS).await, 2);
}

#[tokio::test]
async fn leftover_containers_on_an_existing_host_are_removed() {
    let host = provisioning_host(SandboxBehavior::default(), fast_config(3));
    let parent = sink(&host, "cleanup-parent").await;
    let host_link = "/resources/compute/h1";
    let stale_link = "/resources/containers/stale-web";

    seed(&host, COMPUTES, ComputeState {
        document_self_link: host_link.into(),
        resource_pool_link: Some(POOL_LINK.into()),
        power_state: PowerState::Running,
        ..ComputeState::default()
    })
    .await;
    seed(&host, CONTAINERS, ContainerState {
        document_self_link: agent_container_link("h1"),
        parent_link: Some(host_link.into()),
        power_state: PowerState::Running,
        ..ContainerState::default()
    })
    .await;
    seed(&host, CONTAINERS, ContainerState {
        document_self_link: stale_link.into(),
        parent_link: Some(host_link.into()),
        power_state: PowerState::Stopped,
        ..ContainerState::default()
    })
    .await;

    let created = host
        .post(SELF_PROVISIONING_FACTORY_LINK, request(1, &parent))
        .await
        .unwrap();
    let done = host.wait_for_terminal(&link_of(&created)).await.unwrap();
    assert_eq!(done["task_info"]["stage"], "FINISHED", "{done:#}");
    assert_eq!(done["compute_resource_links"], json!([host_link]));

    assert!(host.get(stale_link).await.unwrap_err().is_not_found());
    assert!(host.get(&agent_container_link("h1")).await.is_ok());
    let containers = done["container_resource_links"].as_array().unwrap();
    assert_eq!(containers.len(), 1);
    assert!(!containers.contains(&json!(stale_link)));
    let container: ContainerState = host
        .get_as(containers[0].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(container.parent_link.as_deref(), Some(host_link));
    assert_eq!(count(&host, COMPUTES).await, 1);
}

#[tokio::test]
async fn unreadable_compute_in_the_pool_is_skipped() {
    let host = provisioning_host(SandboxBehavior::default(), fast_config(3));
    let parent = sink(&host, "unreadable-parent").await;
    host.post(
        COMPUTES,
        json!({
            "document_self_link": "/resources/compute/broken",
            "resource_pool_link": POOL_LINK,
            "power_state": 42,
        }),
    )
    .await
    .unwrap();

    let created = host
        .post(SELF_PROVISIONING_FACTORY_LINK, request(1, &parent))
        .await
        .unwrap();
    let done = host.wait_for_terminal(&link_of(&created)).await.unwrap();
    assert_eq!(done["task_info"]["stage"], "FINISHED", "{done:#}");
    let computes = done["compute_resource_links"].as_array().unwrap();
    assert_eq!(computes.len(), 1);
    assert_ne!(computes[0], "/resources/compute/broken");
    assert_eq!(count(&host, COMPUTES).await, 2);
}

#[tokio::test]
async fn agent_that_never_runs_fails_the_task_once() {
    let behavior = SandboxBehavior {
        agent_power_state: PowerState::Stopped,
        ..SandboxBehavior::default()
    };
    let host = provisioning_host(behavior, fast_config(2));
    let parent = sink(&host, "stopped-agent-parent").await;
    let mut events = host.subscribe_events();

    let created = host
        .post(SELF_PROVISIONING_FACTORY_LINK, request(2, &parent))
        .await
        .unwrap();
    let link = link_of(&created);

    let done = host.wait_for_terminal(&link).await.unwrap();
    assert_eq!(done["task_info"]["stage"], "FAILED");
    let message = done["task_info"]["failure_message"].as_str().unwrap();
    assert!(message.contains("not available"), "{message}");
    assert!(done["container_resource_links"].as_array().unwrap().is_empty());

    assert_eq!(parent_stage(&host, &parent).await, "FAILED");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifications_from(&drain_events(&mut events), &link), 1);
}
