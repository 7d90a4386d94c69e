//! Concrete tasks and the documents they work with.

pub mod data_collection;
pub mod resources;
pub mod self_provisioning;

pub use data_collection::{
    EntityDataCollection, EntityKind, EntityListing, EntityListingAdapter, KubernetesEntityState,
    ReconciliationReport, TriggerOutcome,
};
pub use self_provisioning::{
    EndpointType, SELF_PROVISIONING_FACTORY_LINK, SelfProvisioningBody, SelfProvisioningPatch,
    SelfProvisioningSubStage, SelfProvisioningTaskService,
};
