//! Documents the concrete tasks create or read, and their factory links.
//!
//! Only the fields the tasks touch are modelled.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::ServiceTaskCallback;
use crate::domain::links::build_uri_path;

pub const RESOURCE_POOLS: &str = "/resources/pools";
pub const GROUP_PLACEMENTS: &str = "/resources/group-placements";
pub const AUTH_CREDENTIALS: &str = "/core/auth/credentials";
pub const COMPUTE_DESCRIPTIONS: &str = "/resources/compute-descriptions";
pub const COMPUTES: &str = "/resources/compute";
pub const CONTAINERS: &str = "/resources/containers";
pub const COMPOSITE_DESCRIPTIONS: &str = "/resources/composite-descriptions";
pub const COMPOSITE_COMPONENTS: &str = "/resources/composite-components";
pub const REQUEST_BROKER: &str = "/requests";

/// Id fragment shared by every agent system container.
pub const AGENT_CONTAINER_ID: &str = "admiral_agent";

/// Request custom property naming the pool new hosts are placed in.
pub const CUSTOM_PROP_RESOURCE_POOL_LINK: &str = "__resourcePoolLink";

/// Link of the agent system container running on a compute host.
pub fn agent_container_link(host_id: &str) -> String {
    build_uri_path(&[CONTAINERS, &format!("{AGENT_CONTAINER_ID}__{host_id}")])
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document_self_link: String,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub project_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupResourcePlacementState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document_self_link: String,
    pub name: String,
    pub resource_pool_link: String,
    pub max_number_instances: u32,
    pub priority: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthCredentialsType {
    PublicKey,
    Password,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthCredentialsState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document_self_link: String,
    #[serde(rename = "type")]
    pub kind: AuthCredentialsType,
    pub user_email: String,
    pub private_key_id: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeDescription {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document_self_link: String,
    pub id: String,
    pub name: String,
    pub zone_id: String,
    #[serde(default)]
    pub supported_children: Vec<String>,
    #[serde(default)]
    pub environment_name: String,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    #[default]
    Unknown,
    Provisioning,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document_self_link: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_link: Option<String>,
    /// Set on the parent endpoint compute, which is not a container host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_management_reference: Option<String>,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenant_links: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document_self_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_link: Option<String>,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.power_state == PowerState::Running
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeDescription {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document_self_link: String,
    pub name: String,
    /// Raw template text.
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeComponent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document_self_link: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    ContainerHost,
    Container,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestOperation {
    #[default]
    Provision,
    ProvisionContainerHosts,
    RemoveResource,
}

/// A request to the request broker: provision or remove resources and
/// report back through the callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBrokerState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document_self_link: String,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub operation: RequestOperation,
    #[serde(default)]
    pub resource_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_description_link: Option<String>,
    #[serde(default)]
    pub resource_links: BTreeSet<String>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub service_task_callback: ServiceTaskCallback,
}

impl RequestBrokerState {
    pub fn new(resource_type: ResourceType, operation: RequestOperation) -> Self {
        Self {
            document_self_link: String::new(),
            resource_type,
            operation,
            resource_count: 0,
            resource_description_link: None,
            resource_links: BTreeSet::new(),
            custom_properties: BTreeMap::new(),
            service_task_callback: ServiceTaskCallback::create_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_container_link_embeds_the_host_id() {
        let link = agent_container_link("host-1");
        assert_eq!(link, "/resources/containers/admiral_agent__host-1");
        assert!(link.contains(AGENT_CONTAINER_ID));
    }

    #[test]
    fn container_running_check() {
        let mut container = ContainerState::default();
        assert!(!container.is_running());
        container.power_state = PowerState::Running;
        assert!(container.is_running());
    }
}
