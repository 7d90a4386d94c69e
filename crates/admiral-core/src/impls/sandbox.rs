//! Sandbox - リモート協調先のプロセス内の代役
//!
//! [`SandboxRequestBroker`] は [`RequestBrokerState`] を受け取り、要求された
//! compute host（agent container つき）や container を store に作成して、
//! 本物の子タスクと同じように request の callback で結果を返します。
//! container は request の resource pool にある host へ順番に割り当てます。
//! [`SandboxEntityListing`] は host ごとに用意した entity 一覧を返します。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::app::{FactoryService, TaskHost};
use crate::domain::links::get_id;
use crate::error::{AdmiralError, Result};
use crate::ports::{Query, SELF_LINK_FIELD};
use crate::tasks::data_collection::{EntityListing, EntityListingAdapter};
use crate::tasks::resources::{
    AGENT_CONTAINER_ID, COMPUTES, CONTAINERS, CUSTOM_PROP_RESOURCE_POOL_LINK, ComputeState,
    ContainerState, PowerState, RequestBrokerState, RequestOperation, agent_container_link,
};

/// Knobs for exercising failure paths.
#[derive(Debug, Clone)]
pub struct SandboxBehavior {
    /// Power state of the agent container created on every new host.
    pub agent_power_state: PowerState,
    /// Operations that report failure instead of doing the work.
    pub failing_operations: Vec<RequestOperation>,
    /// Pause before a request is processed.
    pub processing_delay: Duration,
}

impl Default for SandboxBehavior {
    fn default() -> Self {
        Self {
            agent_power_state: PowerState::Running,
            failing_operations: Vec::new(),
            processing_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxRequestBroker {
    behavior: SandboxBehavior,
}

impl SandboxRequestBroker {
    pub fn new(behavior: SandboxBehavior) -> Self {
        Self { behavior }
    }
}

#[async_trait]
impl FactoryService for SandboxRequestBroker {
    async fn create(&self, host: &TaskHost, factory_link: &str, body: Value) -> Result<Value> {
        let request: RequestBrokerState = serde_json::from_value(body)
            .map_err(|e| AdmiralError::validation(format!("malformed request: {e}")))?;
        let stored = host
            .store()
            .create(factory_link, serde_json::to_value(&request)?)
            .await?;

        let span = info_span!("request", link = %stored.link, operation = ?request.operation);
        tokio::spawn(
            process(host.clone(), self.behavior.clone(), request, stored.link.clone())
                .instrument(span),
        );
        Ok(stored.body)
    }
}

async fn process(
    host: TaskHost,
    behavior: SandboxBehavior,
    request: RequestBrokerState,
    request_link: String,
) {
    if !behavior.processing_delay.is_zero() {
        tokio::time::sleep(behavior.processing_delay).await;
    }

    let outcome = if behavior.failing_operations.contains(&request.operation) {
        Err(AdmiralError::remote(format!(
            "{:?} request {request_link} failed",
            request.operation
        )))
    } else {
        match request.operation {
            RequestOperation::ProvisionContainerHosts => {
                provision_hosts(&host, &behavior, &request).await
            }
            RequestOperation::Provision => provision_containers(&host, &request).await,
            RequestOperation::RemoveResource => remove_resources(&host, &request).await,
        }
    };

    let callback = &request.service_task_callback;
    let response = match outcome {
        Ok(links) => {
            info!(count = links.len(), "request completed");
            if let Err(e) = host
                .store()
                .patch(&request_link, json!({ "resource_links": links }))
                .await
            {
                debug!(error = %e, "cannot record request results");
            }
            callback.finished_response().with_resource_links(links)
        }
        Err(e) => {
            warn!(error = %e, "request failed");
            callback.failed_response(Some(e.to_string()))
        }
    };

    if callback.is_empty() {
        return;
    }
    let result = async {
        let parent = callback.target_link()?;
        host.patch_from(parent, serde_json::to_value(&response)?, Some(&request_link))
            .await
    }
    .await;
    if let Err(e) = result {
        warn!(error = %e, "request callback failed");
    }
}

async fn post_for_link<T: Serialize>(host: &TaskHost, factory_link: &str, doc: &T) -> Result<String> {
    let created = host.post(factory_link, serde_json::to_value(doc)?).await?;
    created
        .get(SELF_LINK_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AdmiralError::remote(format!("{factory_link} returned no link")))
}

async fn provision_hosts(
    host: &TaskHost,
    behavior: &SandboxBehavior,
    request: &RequestBrokerState,
) -> Result<Vec<String>> {
    let pool = request
        .custom_properties
        .get(CUSTOM_PROP_RESOURCE_POOL_LINK)
        .cloned();
    let mut links = Vec::new();
    for _ in 0..request.resource_count {
        let compute = ComputeState {
            resource_pool_link: pool.clone(),
            description_link: request.resource_description_link.clone(),
            power_state: PowerState::Running,
            ..ComputeState::default()
        };
        let compute_link = post_for_link(host, COMPUTES, &compute).await?;

        let agent = ContainerState {
            document_self_link: agent_container_link(get_id(&compute_link)),
            parent_link: Some(compute_link.clone()),
            power_state: behavior.agent_power_state,
            names: vec![AGENT_CONTAINER_ID.to_string()],
            ..ContainerState::default()
        };
        post_for_link(host, CONTAINERS, &agent).await?;
        debug!(compute = %compute_link, "compute host provisioned");
        links.push(compute_link);
    }
    Ok(links)
}

/// Containers are spread round-robin over the hosts of the request's pool.
async fn provision_containers(host: &TaskHost, request: &RequestBrokerState) -> Result<Vec<String>> {
    let parents = pool_hosts(host, request).await?;
    let mut links = Vec::new();
    for index in 0..request.resource_count {
        let parent_link = (!parents.is_empty()).then(|| parents[index as usize % parents.len()].clone());
        let container = ContainerState {
            description_link: request.resource_description_link.clone(),
            parent_link,
            power_state: PowerState::Running,
            names: vec![format!("admiral-{index}")],
            ..ContainerState::default()
        };
        links.push(post_for_link(host, CONTAINERS, &container).await?);
    }
    Ok(links)
}

async fn pool_hosts(host: &TaskHost, request: &RequestBrokerState) -> Result<Vec<String>> {
    let Some(pool) = request.custom_properties.get(CUSTOM_PROP_RESOURCE_POOL_LINK) else {
        return Ok(Vec::new());
    };
    let docs = host
        .query(Query::of_kind(COMPUTES).field_eq("resource_pool_link", pool.clone()))
        .await?
        .collect_all()
        .await?;
    Ok(docs
        .into_iter()
        .filter(|doc| {
            doc.decode::<ComputeState>()
                .is_ok_and(|compute| compute.adapter_management_reference.is_none())
        })
        .map(|doc| doc.link)
        .collect())
}

async fn remove_resources(host: &TaskHost, request: &RequestBrokerState) -> Result<Vec<String>> {
    for link in &request.resource_links {
        match host.delete(link).await {
            Ok(()) => debug!(link = %link, "resource removed"),
            Err(e) if e.is_not_found() => debug!(link = %link, "resource already gone"),
            Err(e) => return Err(e),
        }
    }
    Ok(Vec::new())
}

/// Entity listings keyed by host link. Unknown hosts are unreachable.
#[derive(Debug, Default)]
pub struct SandboxEntityListing {
    listings: DashMap<String, EntityListing>,
    delay: Duration,
    refreshed: AtomicUsize,
}

impl SandboxEntityListing {
    /// Listings answer only after `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn set_listing(&self, host_link: &str, listing: EntityListing) {
        self.listings.insert(host_link.to_string(), listing);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityListingAdapter for SandboxEntityListing {
    async fn list_entities(&self, host_link: &str) -> Result<EntityListing> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.listings
            .get(host_link)
            .map(|listing| listing.clone())
            .ok_or_else(|| AdmiralError::remote(format!("host {host_link} is not reachable")))
    }

    async fn refresh_entity(&self, _entity_link: &str) -> Result<()> {
        self.refreshed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
