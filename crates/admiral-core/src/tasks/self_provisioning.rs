//! Self-provisioning task: stand up a container host cluster on a cloud
//! endpoint and deploy the management cluster template on it.
//!
//! # Flow
//! 1. resource pool and group placement (create-if-absent, joined)
//! 2. reuse container hosts already in the pool, or
//! 3. auth credentials (create-if-absent) -> compute description ->
//!    compute request (transient wait for the request's callback)
//! 4. import the cluster template as a composite description
//! 5. poll every host's agent container until RUNNING
//! 6. remove leftover containers on the hosts
//! 7. container request (transient wait) -> COMPLETED
//!
//! Child links derive from the task id and the inputs, so a re-run finds
//! what an earlier run created instead of duplicating it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::resources::{
    AGENT_CONTAINER_ID, AUTH_CREDENTIALS, AuthCredentialsState, AuthCredentialsType,
    COMPOSITE_DESCRIPTIONS, COMPUTE_DESCRIPTIONS, COMPUTES, CONTAINERS,
    CUSTOM_PROP_RESOURCE_POOL_LINK, CompositeDescription, ComputeDescription, ComputeState,
    ContainerState, GROUP_PLACEMENTS, GroupResourcePlacementState, REQUEST_BROKER,
    RESOURCE_POOLS, RequestBrokerState, RequestOperation, ResourcePoolState, ResourceType,
    agent_container_link,
};
use crate::app::{Condition, TaskContext, TaskDoc, TaskService};
use crate::domain::links::{build_uri_path, get_id};
use crate::domain::{ServiceTaskCallbackResponse, SubStage, TaskBody, TaskPatch};
use crate::error::{AdmiralError, Result};
use crate::ports::{Query, SELF_LINK_FIELD};

pub const SELF_PROVISIONING_FACTORY_LINK: &str = "/self-provisioning";

const RESOURCE_POOL_ID: &str = "hosts-resource-pool";
const AUTH_CREDENTIALS_ID: &str = "auth-credentials";
const CLUSTER_TEMPLATE_NAME: &str = "admiral-cluster";
const CLUSTER_TEMPLATE: &str = include_str!("../../templates/admiral-cluster.yaml");
const SECURITY_GROUP_PROPERTY: &str = "awsSecurityGroup";
const DOCKER_CONTAINER_CHILD: &str = "DOCKER_CONTAINER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelfProvisioningSubStage {
    Created,
    ResourcePoolCreated,
    QueryForContainerHosts,
    AuthCredentialsCreated,
    ComputeDescCreated,
    ComputeProvisioningStarted,
    ComputeProvisioningCompleted,
    TemplateLoaded,
    CleanupContainersStarted,
    CleanupContainersCompleted,
    ContainerProvisioningStarted,
    ContainerProvisioningCompleted,
    Completed,
    Error,
}

impl SubStage for SelfProvisioningSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::ResourcePoolCreated,
        Self::QueryForContainerHosts,
        Self::AuthCredentialsCreated,
        Self::ComputeDescCreated,
        Self::ComputeProvisioningStarted,
        Self::ComputeProvisioningCompleted,
        Self::TemplateLoaded,
        Self::CleanupContainersStarted,
        Self::CleanupContainersCompleted,
        Self::ContainerProvisioningStarted,
        Self::ContainerProvisioningCompleted,
        Self::Completed,
        Self::Error,
    ];

    fn is_transient(self) -> bool {
        match self {
            Self::ComputeProvisioningStarted | Self::ContainerProvisioningStarted => true,
            Self::Created
            | Self::ResourcePoolCreated
            | Self::QueryForContainerHosts
            | Self::AuthCredentialsCreated
            | Self::ComputeDescCreated
            | Self::ComputeProvisioningCompleted
            | Self::TemplateLoaded
            | Self::CleanupContainersStarted
            | Self::CleanupContainersCompleted
            | Self::ContainerProvisioningCompleted
            | Self::Completed
            | Self::Error => false,
        }
    }

    /// One step forward, plus the jumps the flow takes on purpose:
    /// reusing existing hosts, and a child's callback overtaking the
    /// self-patch into the transient wait.
    fn allows(self, next: Self) -> bool {
        use SelfProvisioningSubStage::*;
        next.ordinal() == self.ordinal() + 1
            || matches!(
                (self, next),
                (ResourcePoolCreated, ComputeProvisioningCompleted)
                    | (ComputeDescCreated, ComputeProvisioningCompleted)
                    | (CleanupContainersCompleted, ContainerProvisioningCompleted)
            )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointType {
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "Azure")]
    Azure,
    #[serde(rename = "GCP")]
    Gcp,
}

impl EndpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "AWS",
            Self::Azure => "Azure",
            Self::Gcp => "GCP",
        }
    }

    fn environment_name(self) -> &'static str {
        match self {
            Self::Aws => "Amazon Web Services",
            Self::Azure => "Microsoft Azure",
            Self::Gcp => "Google Cloud Platform",
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointType {
    type Err = AdmiralError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            other => Err(AdmiralError::validation(format!(
                "unknown endpoint type '{other}'"
            ))),
        }
    }
}

/// Inputs and task-managed links of a self-provisioning task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfProvisioningBody {
    pub endpoint_auth_key: String,
    pub endpoint_auth_private_key: String,
    pub availability_zone_id: String,
    pub security_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_type: Option<EndpointType>,
    pub compute_instance_type: String,
    /// Number of container hosts; 0 or less means 1.
    pub cluster_size: i64,
    pub compute_resource_links: BTreeSet<String>,
    pub container_resource_links: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_description_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_description_link: Option<String>,
}

/// Fields the task sets on itself as it goes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfProvisioningPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_resource_links: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_resource_links: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_description_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_description_link: Option<String>,
}

impl TaskBody for SelfProvisioningBody {
    type Patch = SelfProvisioningPatch;

    fn merge(&mut self, patch: SelfProvisioningPatch) {
        if let Some(links) = patch.compute_resource_links {
            self.compute_resource_links.extend(links);
        }
        if let Some(links) = patch.container_resource_links {
            self.container_resource_links.extend(links);
        }
        if self.compute_description_link.is_none() {
            self.compute_description_link = patch.compute_description_link;
        }
        if self.composite_description_link.is_none() {
            self.composite_description_link = patch.composite_description_link;
        }
    }
}

impl SelfProvisioningBody {
    fn endpoint(&self) -> Result<EndpointType> {
        self.endpoint_type
            .ok_or_else(|| AdmiralError::validation("endpoint_type is required"))
    }

    pub fn resource_pool_id(&self) -> Result<String> {
        Ok(format!(
            "{RESOURCE_POOL_ID}-{}-{}",
            self.endpoint()?,
            self.availability_zone_id
        ))
    }

    pub fn resource_pool_link(&self) -> Result<String> {
        Ok(build_uri_path(&[RESOURCE_POOLS, &self.resource_pool_id()?]))
    }

    pub fn auth_credentials_link(&self) -> Result<String> {
        Ok(build_uri_path(&[
            AUTH_CREDENTIALS,
            &format!(
                "{AUTH_CREDENTIALS_ID}-{}-{}",
                self.endpoint()?,
                self.endpoint_auth_key
            ),
        ]))
    }

    fn requested_hosts(&self) -> u64 {
        self.cluster_size.max(1) as u64
    }
}

type SelfProvisioningDoc = TaskDoc<SelfProvisioningTaskService>;
type SelfProvisioningContext = TaskContext<SelfProvisioningTaskService>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SelfProvisioningTaskService;

#[async_trait]
impl TaskService for SelfProvisioningTaskService {
    type SubStage = SelfProvisioningSubStage;
    type Body = SelfProvisioningBody;

    const FACTORY_LINK: &'static str = SELF_PROVISIONING_FACTORY_LINK;
    const DISPLAY_NAME: &'static str = "Self Provisioning";

    fn validate_state_on_start(&self, state: &mut SelfProvisioningDoc) -> Result<()> {
        let body = &mut state.body;
        let required = [
            ("endpoint_auth_key", &body.endpoint_auth_key),
            ("endpoint_auth_private_key", &body.endpoint_auth_private_key),
            ("availability_zone_id", &body.availability_zone_id),
            ("security_group", &body.security_group),
            ("compute_instance_type", &body.compute_instance_type),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(AdmiralError::validation(format!("{field} is required")));
            }
        }
        body.endpoint()?;
        if body.cluster_size <= 0 {
            body.cluster_size = 1;
        }
        Ok(())
    }

    async fn handle_started_stage(
        &self,
        ctx: &SelfProvisioningContext,
        state: SelfProvisioningDoc,
    ) -> Result<()> {
        use SelfProvisioningSubStage::*;
        match state.task_sub_stage {
            Created => {
                let pool_link = state.body.resource_pool_link()?;
                ctx.create_if_not_exists(&pool_link, ResourcePoolCreated, |next| {
                    self.create_resource_pool(ctx, &state, next)
                })
                .await
            }
            ResourcePoolCreated => self.query_for_container_hosts(ctx, &state).await,
            QueryForContainerHosts => {
                let auth = AuthCredentialsState {
                    document_self_link: state.body.auth_credentials_link()?,
                    kind: AuthCredentialsType::PublicKey,
                    user_email: AUTH_CREDENTIALS_ID.to_string(),
                    private_key_id: state.body.endpoint_auth_key.clone(),
                    private_key: state.body.endpoint_auth_private_key.clone(),
                };
                let auth_link = auth.document_self_link.clone();
                ctx.create_if_not_exists(&auth_link, AuthCredentialsCreated, |next| async move {
                    ctx.create_document(AUTH_CREDENTIALS, &auth, next)
                        .await
                        .map(|_| ())
                })
                .await
            }
            AuthCredentialsCreated => self.create_compute_description(ctx, &state).await,
            ComputeDescCreated => self.request_compute_hosts(ctx, &state).await,
            ComputeProvisioningStarted | ContainerProvisioningStarted => Ok(()),
            ComputeProvisioningCompleted => self.load_template(ctx, &state).await,
            TemplateLoaded => {
                self.wait_for_agents(ctx, &state);
                Ok(())
            }
            CleanupContainersStarted => self.remove_leftover_containers(ctx, &state).await,
            CleanupContainersCompleted => self.request_containers(ctx, &state).await,
            ContainerProvisioningCompleted => {
                let containers: BTreeSet<String> = state
                    .resource_links
                    .difference(&state.body.compute_resource_links)
                    .cloned()
                    .collect();
                info!(containers = ?containers, "container resources provisioned");
                ctx.proceed_to_with(Completed, |patch| {
                    patch.body.container_resource_links = Some(containers);
                });
                Ok(())
            }
            Completed => {
                ctx.complete();
                Ok(())
            }
            Error => {
                ctx.complete_with_error();
                Ok(())
            }
        }
    }

    fn finished_callback_response(&self, state: &SelfProvisioningDoc) -> ServiceTaskCallbackResponse {
        if state.body.container_resource_links.is_empty() {
            warn!("no container resource links to report");
        }
        state
            .service_task_callback
            .finished_response()
            .with_resource_links(state.body.container_resource_links.iter().cloned())
    }
}

impl SelfProvisioningTaskService {
    async fn create_resource_pool(
        &self,
        ctx: &SelfProvisioningContext,
        state: &SelfProvisioningDoc,
        next: SelfProvisioningSubStage,
    ) -> Result<()> {
        let body = &state.body;
        let endpoint = body.endpoint()?;
        let pool_id = body.resource_pool_id()?;
        let pool = ResourcePoolState {
            document_self_link: body.resource_pool_link()?,
            id: pool_id.clone(),
            name: pool_id,
            project_name: endpoint.to_string(),
        };
        let placement_name = format!("placement-{endpoint}-{}", body.availability_zone_id);
        let placement = GroupResourcePlacementState {
            document_self_link: placement_name.clone(),
            name: placement_name,
            resource_pool_link: pool.document_self_link.clone(),
            max_number_instances: ctx.host().config().provisioning.placement_max_instances,
            priority: 1,
        };

        let host = ctx.host();
        let pool = serde_json::to_value(&pool)?;
        let placement = serde_json::to_value(&placement)?;
        let (pool_created, placement_created) = tokio::join!(
            host.post(RESOURCE_POOLS, pool),
            host.post(GROUP_PLACEMENTS, placement),
        );
        for result in [pool_created, placement_created] {
            match result {
                Ok(_) => {}
                Err(e) if e.is_conflict() => info!(error = %e, "already created"),
                Err(e) => {
                    return Err(AdmiralError::remote(format!(
                        "resource pool or group placement can't be created: {e}"
                    )));
                }
            }
        }
        ctx.proceed_to(next);
        Ok(())
    }

    /// Hosts already in the pool skip compute provisioning. The endpoint's
    /// own compute (the one with an adapter reference) is not a host.
    async fn query_for_container_hosts(
        &self,
        ctx: &SelfProvisioningContext,
        state: &SelfProvisioningDoc,
    ) -> Result<()> {
        let pool_link = state.body.resource_pool_link()?;
        let docs = ctx
            .host()
            .query(Query::of_kind(COMPUTES).field_eq("resource_pool_link", pool_link.clone()))
            .await?
            .collect_all()
            .await?;

        let mut hosts = BTreeSet::new();
        for doc in docs {
            let compute: ComputeState = match doc.decode() {
                Ok(compute) => compute,
                Err(e) => {
                    warn!(compute = %doc.link, error = %e, "unreadable compute state, skipped");
                    continue;
                }
            };
            if compute.adapter_management_reference.is_some() {
                continue;
            }
            info!(compute = %doc.link, pool = %pool_link, "container host found");
            hosts.insert(doc.link);
        }

        if hosts.is_empty() {
            ctx.proceed_to(SelfProvisioningSubStage::QueryForContainerHosts);
        } else {
            ctx.proceed_to_with(SelfProvisioningSubStage::ComputeProvisioningCompleted, |patch| {
                patch.body.compute_resource_links = Some(hosts);
            });
        }
        Ok(())
    }

    async fn create_compute_description(
        &self,
        ctx: &SelfProvisioningContext,
        state: &SelfProvisioningDoc,
    ) -> Result<()> {
        let body = &state.body;
        let endpoint = body.endpoint()?;
        let description = ComputeDescription {
            document_self_link: String::new(),
            id: format!(
                "{endpoint}-{}-{}",
                body.availability_zone_id,
                ctx.host().id_generator().generate_id()
            ),
            name: body.compute_instance_type.clone(),
            zone_id: body.availability_zone_id.clone(),
            supported_children: vec![DOCKER_CONTAINER_CHILD.to_string()],
            environment_name: endpoint.environment_name().to_string(),
            custom_properties: BTreeMap::from([(
                SECURITY_GROUP_PROPERTY.to_string(),
                body.security_group.clone(),
            )]),
        };
        let created = ctx
            .host()
            .post(COMPUTE_DESCRIPTIONS, serde_json::to_value(&description)?)
            .await
            .map_err(|e| {
                AdmiralError::remote(format!(
                    "compute description {} can't be created: {e}",
                    description.id
                ))
            })?;
        let link = link_of(&created)?;
        info!(link = %link, "compute description created");
        ctx.proceed_to_with(SelfProvisioningSubStage::ComputeDescCreated, |patch| {
            patch.body.compute_description_link = Some(link);
        });
        Ok(())
    }

    async fn request_compute_hosts(
        &self,
        ctx: &SelfProvisioningContext,
        state: &SelfProvisioningDoc,
    ) -> Result<()> {
        let mut request = RequestBrokerState::new(
            ResourceType::ContainerHost,
            RequestOperation::ProvisionContainerHosts,
        );
        request.document_self_link = format!("{}-compute", ctx.id());
        request.resource_count = state.body.requested_hosts();
        request.resource_description_link = state.body.compute_description_link.clone();
        request.custom_properties = state.custom_properties.clone();
        request.custom_properties.insert(
            CUSTOM_PROP_RESOURCE_POOL_LINK.to_string(),
            state.body.resource_pool_link()?,
        );
        request.service_task_callback =
            ctx.callback_to_self(SelfProvisioningSubStage::ComputeProvisioningCompleted);

        ctx.create_document(
            REQUEST_BROKER,
            &request,
            SelfProvisioningSubStage::ComputeProvisioningStarted,
        )
        .await
        .map(|_| ())
    }

    async fn load_template(
        &self,
        ctx: &SelfProvisioningContext,
        state: &SelfProvisioningDoc,
    ) -> Result<()> {
        let hosts: BTreeSet<String> = state
            .body
            .compute_resource_links
            .union(&state.resource_links)
            .cloned()
            .collect();
        info!(hosts = ?hosts, "compute resources provisioned");

        let description = CompositeDescription {
            document_self_link: String::new(),
            name: CLUSTER_TEMPLATE_NAME.to_string(),
            content: CLUSTER_TEMPLATE.to_string(),
        };
        let created = ctx
            .host()
            .post(COMPOSITE_DESCRIPTIONS, serde_json::to_value(&description)?)
            .await
            .map_err(|e| AdmiralError::remote(format!("failure importing template: {e}")))?;
        let link = link_of(&created)?;

        ctx.proceed_to_with(SelfProvisioningSubStage::TemplateLoaded, |patch| {
            patch.body.compute_resource_links = Some(hosts);
            patch.body.composite_description_link = Some(link);
        });
        Ok(())
    }

    /// Polls every agent container; the first host that never comes up
    /// moves the task to ERROR, once.
    fn wait_for_agents(&self, ctx: &SelfProvisioningContext, state: &SelfProvisioningDoc) {
        let agents: Vec<String> = state
            .body
            .compute_resource_links
            .iter()
            .map(|host| agent_container_link(get_id(host)))
            .collect();
        let running: Condition = Arc::new(|body: &Value| {
            serde_json::from_value::<ContainerState>(body.clone()).is_ok_and(|c| c.is_running())
        });

        let ready = ctx.clone();
        let failed = ctx.clone();
        ctx.poller().wait_all(
            agents,
            running,
            move || ready.proceed_to(SelfProvisioningSubStage::CleanupContainersStarted),
            move |message| {
                let mut patch = TaskPatch::started(SelfProvisioningSubStage::Error);
                patch.failure_message = Some(message);
                failed.send_self_patch(patch);
            },
        );
    }

    async fn remove_leftover_containers(
        &self,
        ctx: &SelfProvisioningContext,
        state: &SelfProvisioningDoc,
    ) -> Result<()> {
        let docs = ctx
            .host()
            .query(Query::of_kind(CONTAINERS).field_in(
                "parent_link",
                state.body.compute_resource_links.iter().cloned(),
            ))
            .await?
            .collect_all()
            .await?;
        let leftovers: BTreeSet<String> = docs
            .into_iter()
            .map(|doc| doc.link)
            .filter(|link| !link.contains(AGENT_CONTAINER_ID))
            .collect();

        if leftovers.is_empty() {
            ctx.proceed_to(SelfProvisioningSubStage::CleanupContainersCompleted);
            return Ok(());
        }
        info!(containers = ?leftovers, "removing leftover containers");
        let mut request =
            RequestBrokerState::new(ResourceType::Container, RequestOperation::RemoveResource);
        request.document_self_link = format!("{}-cleanup", ctx.id());
        request.resource_links = leftovers;
        // The broker moves the task on once the containers are gone.
        request.service_task_callback =
            ctx.callback_to_self(SelfProvisioningSubStage::CleanupContainersCompleted);
        match ctx
            .host()
            .post(REQUEST_BROKER, serde_json::to_value(&request)?)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                info!(error = %e, "cleanup already requested");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn request_containers(
        &self,
        ctx: &SelfProvisioningContext,
        state: &SelfProvisioningDoc,
    ) -> Result<()> {
        let mut request = RequestBrokerState::new(ResourceType::Container, RequestOperation::Provision);
        request.document_self_link = format!("{}-container", ctx.id());
        request.resource_count = state.body.requested_hosts();
        request.resource_description_link = state.body.composite_description_link.clone();
        request.custom_properties = state.custom_properties.clone();
        request.custom_properties.insert(
            CUSTOM_PROP_RESOURCE_POOL_LINK.to_string(),
            state.body.resource_pool_link()?,
        );
        request.service_task_callback =
            ctx.callback_to_self(SelfProvisioningSubStage::ContainerProvisioningCompleted);

        ctx.create_document(
            REQUEST_BROKER,
            &request,
            SelfProvisioningSubStage::ContainerProvisioningStarted,
        )
        .await
        .map(|_| ())
    }
}

fn link_of(created: &Value) -> Result<String> {
    created
        .get(SELF_LINK_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AdmiralError::remote("created document has no link"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transition::{Transition, evaluate};
    use crate::domain::{TaskStage, TaskState};
    use super::SelfProvisioningSubStage::*;
    use rstest::rstest;

    fn input() -> SelfProvisioningDoc {
        SelfProvisioningDoc::with_body(SelfProvisioningBody {
            endpoint_auth_key: "AKIA".into(),
            endpoint_auth_private_key: "secret".into(),
            availability_zone_id: "us-east-1a".into(),
            security_group: "admiral".into(),
            endpoint_type: Some(EndpointType::Aws),
            compute_instance_type: "t2.micro".into(),
            ..SelfProvisioningBody::default()
        })
    }

    #[rstest]
    #[case(0, 1)]
    #[case(-3, 1)]
    #[case(4, 4)]
    fn cluster_size_is_corrected_on_start(#[case] requested: i64, #[case] expected: i64) {
        let mut state = input();
        state.body.cluster_size = requested;
        SelfProvisioningTaskService
            .validate_state_on_start(&mut state)
            .unwrap();
        assert_eq!(state.body.cluster_size, expected);
    }

    #[test]
    fn blank_required_input_is_rejected() {
        let mut state = input();
        state.body.security_group = "  ".into();
        let err = SelfProvisioningTaskService
            .validate_state_on_start(&mut state)
            .unwrap_err();
        assert!(err.to_string().contains("security_group"));

        let mut state = input();
        state.body.endpoint_type = None;
        assert!(matches!(
            SelfProvisioningTaskService.validate_state_on_start(&mut state),
            Err(AdmiralError::Validation(_))
        ));
    }

    #[test]
    fn child_links_are_deterministic() {
        let body = input().body;
        assert_eq!(
            body.resource_pool_link().unwrap(),
            "/resources/pools/hosts-resource-pool-AWS-us-east-1a"
        );
        assert_eq!(
            body.auth_credentials_link().unwrap(),
            "/core/auth/credentials/auth-credentials-AWS-AKIA"
        );
    }

    #[rstest]
    #[case(Created, ResourcePoolCreated, true)]
    #[case(ResourcePoolCreated, ComputeProvisioningCompleted, true)]
    #[case(ComputeDescCreated, ComputeProvisioningCompleted, true)]
    #[case(CleanupContainersCompleted, ContainerProvisioningCompleted, true)]
    #[case(Created, AuthCredentialsCreated, false)]
    #[case(TemplateLoaded, CleanupContainersCompleted, false)]
    fn transition_table(
        #[case] from: SelfProvisioningSubStage,
        #[case] to: SelfProvisioningSubStage,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.allows(to), allowed);
    }

    #[test]
    fn late_patch_into_a_transient_wait_is_dropped() {
        let current = TaskState {
            stage: TaskStage::Started,
            sub_stage: ComputeProvisioningCompleted,
            failure_message: None,
        };
        assert!(matches!(
            evaluate(&current, TaskStage::Started, Some(ComputeProvisioningStarted)),
            Transition::Ignore(_)
        ));
        assert!(matches!(
            evaluate(&current, TaskStage::Started, Some(ComputeDescCreated)),
            Transition::Reject(_)
        ));
    }

    #[test]
    fn endpoint_type_parses_case_insensitively() {
        assert_eq!("aws".parse::<EndpointType>().unwrap(), EndpointType::Aws);
        assert_eq!("Azure".parse::<EndpointType>().unwrap(), EndpointType::Azure);
        assert!("openstack".parse::<EndpointType>().is_err());
        assert_eq!(serde_json::to_value(EndpointType::Gcp).unwrap(), "GCP");
    }

    #[test]
    fn task_managed_links_are_set_once() {
        let mut body = SelfProvisioningBody::default();
        body.merge(SelfProvisioningPatch {
            compute_description_link: Some("/a".into()),
            compute_resource_links: Some(BTreeSet::from(["/h1".to_string()])),
            ..Default::default()
        });
        body.merge(SelfProvisioningPatch {
            compute_description_link: Some("/b".into()),
            compute_resource_links: Some(BTreeSet::from(["/h2".to_string()])),
            ..Default::default()
        });
        assert_eq!(body.compute_description_link.as_deref(), Some("/a"));
        assert_eq!(body.compute_resource_links.len(), 2);
    }
}
