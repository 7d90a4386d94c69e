//! Entity data collection: converge the locally stored Kubernetes entities
//! of a compute host with what the host currently reports.
//!
//! # Algorithm
//! 1. claim the host (at most one collection per host at a time); a
//!    second trigger while one runs is answered with `NotModified`
//! 2. query the local entities of the host and fetch the remote listing
//! 3. local entities still listed are kept (and refreshed), the others are
//!    deleted
//! 4. listed entities without a local record are created, after re-checking
//!    their deterministic link; their composite component is created lazily
//! 5. release the host, whatever happened to individual items
//!
//! Item failures are logged and counted in the [`ReconciliationReport`];
//! they never abort the batch.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::resources::{COMPOSITE_COMPONENTS, CompositeComponent, ComputeState};
use crate::app::TaskHost;
use crate::domain::links::build_uri_path;
use crate::error::{AdmiralError, Result};
use crate::ports::{Query, StoredDocument};

pub const DISCOVERED_DESCRIPTION_LINK: &str = "/resources/kubernetes-descriptions/discovered";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Pod,
    Service,
    Deployment,
    ReplicationController,
    ReplicaSet,
    Namespace,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        Self::Pod,
        Self::Service,
        Self::Deployment,
        Self::ReplicationController,
        Self::ReplicaSet,
        Self::Namespace,
    ];

    pub fn factory_link(self) -> &'static str {
        match self {
            Self::Pod => "/resources/kubernetes-pods",
            Self::Service => "/resources/kubernetes-services",
            Self::Deployment => "/resources/kubernetes-deployments",
            Self::ReplicationController => "/resources/kubernetes-replication-controllers",
            Self::ReplicaSet => "/resources/kubernetes-replica-sets",
            Self::Namespace => "/resources/kubernetes-namespaces",
        }
    }

    /// Deterministic link of the entity with remote id `id`.
    pub fn entity_link(self, id: &str) -> String {
        build_uri_path(&[self.factory_link(), id])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pod => "POD",
            Self::Service => "SERVICE",
            Self::Deployment => "DEPLOYMENT",
            Self::ReplicationController => "REPLICATION_CONTROLLER",
            Self::ReplicaSet => "REPLICA_SET",
            Self::Namespace => "NAMESPACE",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = AdmiralError;

    /// Accepts both the wire form (`REPLICA_SET`) and the Kubernetes kind
    /// (`ReplicaSet`).
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "pod" => Ok(Self::Pod),
            "service" => Ok(Self::Service),
            "deployment" => Ok(Self::Deployment),
            "replicationcontroller" => Ok(Self::ReplicationController),
            "replicaset" => Ok(Self::ReplicaSet),
            "namespace" => Ok(Self::Namespace),
            _ => Err(AdmiralError::validation(format!("unknown entity kind '{s}'"))),
        }
    }
}

/// What a host reports: entity id -> name / kind / composite group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityListing {
    pub entity_ids_and_names: BTreeMap<String, String>,
    pub entity_ids_and_types: BTreeMap<String, String>,
    pub entity_ids_and_groups: BTreeMap<String, String>,
}

impl EntityListing {
    pub fn with_entity(mut self, id: &str, name: &str, kind: &str) -> Self {
        self.entity_ids_and_names.insert(id.to_string(), name.to_string());
        self.entity_ids_and_types.insert(id.to_string(), kind.to_string());
        self
    }

    pub fn with_group(mut self, id: &str, group: &str) -> Self {
        self.entity_ids_and_groups
            .insert(id.to_string(), group.to_string());
        self
    }
}

/// Remote side of the collection.
#[async_trait]
pub trait EntityListingAdapter: Send + Sync {
    async fn list_entities(&self, host_link: &str) -> Result<EntityListing>;

    /// Re-inspect an entity that is still present.
    async fn refresh_entity(&self, _entity_link: &str) -> Result<()> {
        Ok(())
    }
}

/// Locally stored Kubernetes entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesEntityState {
    pub document_self_link: String,
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityKind>,
    pub parent_link: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tenant_links: Vec<String>,
    pub description_link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_component_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub created: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Set when the collection could not run at all.
    pub aborted: Option<String>,
}

impl ReconciliationReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Created => self.created += 1,
            ItemOutcome::Deleted => self.deleted += 1,
            ItemOutcome::Unchanged => self.unchanged += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }

    fn abort(mut self, reason: String) -> Self {
        error!(reason = %reason, "data collection aborted");
        self.aborted = Some(reason);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Created,
    Deleted,
    Unchanged,
    Skipped,
    Failed,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// A collection was started; the handle yields its report.
    Started(JoinHandle<ReconciliationReport>),
    /// A collection for the host is already running.
    NotModified,
    /// The trigger named no host.
    Ignored,
}

/// Releases the claim on a host when the collection ends, even on panic.
struct ScopeGuard {
    scopes: Arc<DashSet<String>>,
    scope: String,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scopes.remove(&self.scope);
        debug!(host = %self.scope, "data collection released");
    }
}

/// One per host process.
#[derive(Clone)]
pub struct EntityDataCollection {
    host: TaskHost,
    adapter: Arc<dyn EntityListingAdapter>,
    in_progress: Arc<DashSet<String>>,
}

impl EntityDataCollection {
    pub fn new(host: TaskHost, adapter: Arc<dyn EntityListingAdapter>) -> Self {
        Self {
            host,
            adapter,
            in_progress: Arc::new(DashSet::new()),
        }
    }

    pub fn is_collecting(&self, host_link: &str) -> bool {
        self.in_progress.contains(host_link)
    }

    /// Start collecting entities of `host_link` unless that is already
    /// happening.
    pub fn trigger(&self, host_link: Option<&str>) -> TriggerOutcome {
        let Some(host_link) = host_link.map(str::trim).filter(|l| !l.is_empty()) else {
            debug!("compute host link is required, nothing to collect");
            return TriggerOutcome::Ignored;
        };
        if !self.in_progress.insert(host_link.to_string()) {
            debug!(host = %host_link, "data collection already running");
            return TriggerOutcome::NotModified;
        }
        let guard = ScopeGuard {
            scopes: self.in_progress.clone(),
            scope: host_link.to_string(),
        };

        let host = self.host.clone();
        let adapter = self.adapter.clone();
        let host_link = host_link.to_string();
        let span = info_span!("data_collection", host = %host_link);
        TriggerOutcome::Started(tokio::spawn(
            async move {
                let _guard = guard;
                let report = reconcile(host, adapter, host_link).await;
                info!(
                    created = report.created,
                    deleted = report.deleted,
                    unchanged = report.unchanged,
                    skipped = report.skipped,
                    failed = report.failed,
                    "data collection finished"
                );
                report
            }
            .instrument(span),
        ))
    }
}

async fn reconcile(
    host: TaskHost,
    adapter: Arc<dyn EntityListingAdapter>,
    host_link: String,
) -> ReconciliationReport {
    let report = ReconciliationReport::default();

    let local = match query_local_entities(&host, &host_link).await {
        Ok(local) => local,
        Err(e) => return report.abort(format!("failed to query local entities: {e}")),
    };
    let listing = match adapter.list_entities(&host_link).await {
        Ok(listing) => listing,
        Err(e) => return report.abort(format!("failed to list remote entities: {e}")),
    };
    reconcile_listing(host, adapter, host_link, local, listing, report).await
}

async fn query_local_entities(host: &TaskHost, host_link: &str) -> Result<Vec<StoredDocument>> {
    let query = Query::of_kinds(EntityKind::ALL.map(EntityKind::factory_link))
        .field_eq("parent_link", host_link);
    host.query(query).await?.collect_all().await
}

async fn reconcile_listing(
    host: TaskHost,
    adapter: Arc<dyn EntityListingAdapter>,
    host_link: String,
    local: Vec<StoredDocument>,
    mut listing: EntityListing,
    mut report: ReconciliationReport,
) -> ReconciliationReport {
    let mut items = JoinSet::new();

    for doc in local {
        let entity: KubernetesEntityState = match doc.decode() {
            Ok(entity) => entity,
            Err(e) => {
                warn!(link = %doc.link, error = %e, "unreadable local entity");
                report.record(ItemOutcome::Failed);
                continue;
            }
        };
        let still_listed =
            !entity.id.is_empty() && listing.entity_ids_and_names.remove(&entity.id).is_some();
        if still_listed {
            let adapter = adapter.clone();
            items.spawn(
                async move {
                    if let Err(e) = adapter.refresh_entity(&doc.link).await {
                        warn!(link = %doc.link, error = %e, "entity refresh failed");
                    }
                    ItemOutcome::Unchanged
                }
                .in_current_span(),
            );
        } else {
            let host = host.clone();
            items.spawn(delete_missing_entity(host, doc.link).in_current_span());
        }
    }

    if !listing.entity_ids_and_names.is_empty() {
        let tenant_links = match host.get_as::<ComputeState>(&host_link).await {
            Ok(compute) => compute.tenant_links,
            Err(e) => {
                error!(error = %e, "failure to retrieve host");
                drain(&mut items, &mut report).await;
                return report.abort(format!("failed to retrieve host {host_link}: {e}"));
            }
        };
        for (id, name) in std::mem::take(&mut listing.entity_ids_and_names) {
            let discovered = Discovered {
                kind: listing.entity_ids_and_types.get(&id).cloned(),
                group: listing.entity_ids_and_groups.get(&id).cloned(),
                id,
                name,
            };
            items.spawn(
                create_discovered_entity(
                    host.clone(),
                    host_link.clone(),
                    tenant_links.clone(),
                    discovered,
                )
                .in_current_span(),
            );
        }
    }

    drain(&mut items, &mut report).await;
    report
}

async fn drain(items: &mut JoinSet<ItemOutcome>, report: &mut ReconciliationReport) {
    while let Some(result) = items.join_next().await {
        match result {
            Ok(outcome) => report.record(outcome),
            Err(e) => {
                warn!(error = %e, "reconciliation item panicked");
                report.record(ItemOutcome::Failed);
            }
        }
    }
}

async fn delete_missing_entity(host: TaskHost, link: String) -> ItemOutcome {
    match host.delete(&link).await {
        Ok(()) => {
            info!(link = %link, "deleted entity missing on the host");
            ItemOutcome::Deleted
        }
        Err(e) if e.is_not_found() => ItemOutcome::Deleted,
        Err(e) => {
            warn!(link = %link, error = %e, "failed deleting entity missing on the host");
            ItemOutcome::Failed
        }
    }
}

struct Discovered {
    id: String,
    name: String,
    kind: Option<String>,
    group: Option<String>,
}

async fn create_discovered_entity(
    host: TaskHost,
    host_link: String,
    tenant_links: Vec<String>,
    discovered: Discovered,
) -> ItemOutcome {
    let Some(kind) = discovered
        .kind
        .as_deref()
        .and_then(|k| k.parse::<EntityKind>().ok())
    else {
        warn!(id = %discovered.id, kind = ?discovered.kind, "dropping entity of unknown kind");
        return ItemOutcome::Skipped;
    };
    if discovered.name.trim().is_empty() {
        warn!(id = %discovered.id, "name not set for entity");
        return ItemOutcome::Skipped;
    }

    // Another collector may have created it since the local query.
    let link = kind.entity_link(&discovered.id);
    match host.get(&link).await {
        Ok(_) => {
            debug!(link = %link, "entity already exists");
            return ItemOutcome::Unchanged;
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            warn!(link = %link, error = %e, "failed to check entity");
            return ItemOutcome::Failed;
        }
    }

    let composite_component_link = match &discovered.group {
        Some(group) => match ensure_composite_component(&host, group).await {
            Ok(link) => Some(link),
            Err(e) => {
                warn!(group = %group, error = %e, "composite component unavailable");
                None
            }
        },
        None => None,
    };

    let entity = KubernetesEntityState {
        document_self_link: link.clone(),
        id: discovered.id,
        name: discovered.name,
        entity_type: Some(kind),
        parent_link: host_link,
        tenant_links,
        description_link: format!(
            "{DISCOVERED_DESCRIPTION_LINK}-{}",
            host.id_generator().generate_id()
        ),
        composite_component_link,
    };
    let body = match serde_json::to_value(&entity) {
        Ok(body) => body,
        Err(e) => {
            warn!(link = %link, error = %e, "cannot encode entity");
            return ItemOutcome::Failed;
        }
    };
    match host.post(kind.factory_link(), body).await {
        Ok(_) => {
            info!(link = %link, "created entity discovered on the host");
            ItemOutcome::Created
        }
        Err(e) if e.is_conflict() => ItemOutcome::Unchanged,
        Err(e) => {
            error!(link = %link, error = %e, "failed to create discovered entity");
            ItemOutcome::Failed
        }
    }
}

/// Check-then-create; losing the race to a concurrent creator is fine.
async fn ensure_composite_component(host: &TaskHost, group: &str) -> Result<String> {
    let link = build_uri_path(&[COMPOSITE_COMPONENTS, group]);
    match host.get(&link).await {
        Ok(_) => return Ok(link),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    let component = CompositeComponent {
        document_self_link: link.clone(),
        name: group.to_string(),
    };
    match host
        .post(COMPOSITE_COMPONENTS, serde_json::to_value(&component)?)
        .await
    {
        Ok(_) => Ok(link),
        Err(e) if e.is_conflict() => Ok(link),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::SandboxEntityListing;
    use crate::tasks::resources::COMPUTES;
    use serde_json::json;

    const HOST: &str = "/resources/compute/k8s-1";

    async fn setup(listing: EntityListing) -> (TaskHost, EntityDataCollection) {
        let host = TaskHost::builder().build().unwrap();
        host.post(
            COMPUTES,
            json!({ "document_self_link": HOST, "tenant_links": ["/tenants/t1"] }),
        )
        .await
        .unwrap();
        let adapter = SandboxEntityListing::default();
        adapter.set_listing(HOST, listing);
        let collection = EntityDataCollection::new(host.clone(), Arc::new(adapter));
        (host, collection)
    }

    async fn run(collection: &EntityDataCollection) -> ReconciliationReport {
        match collection.trigger(Some(HOST)) {
            TriggerOutcome::Started(handle) => handle.await.unwrap(),
            other => panic!("collection did not start: {other:?}"),
        }
    }

    #[test]
    fn entity_kind_accepts_both_spellings() {
        assert_eq!("ReplicaSet".parse::<EntityKind>().unwrap(), EntityKind::ReplicaSet);
        assert_eq!("REPLICA_SET".parse::<EntityKind>().unwrap(), EntityKind::ReplicaSet);
        assert!("CronJob".parse::<EntityKind>().is_err());
    }

    #[tokio::test]
    async fn new_entities_are_created_with_host_tenancy() {
        let listing = EntityListing::default()
            .with_entity("p1", "web", "Pod")
            .with_entity("s1", "web-svc", "SERVICE")
            .with_group("p1", "shop");
        let (host, collection) = setup(listing).await;

        let report = run(&collection).await;
        assert_eq!(report.created, 2);
        assert_eq!(report.aborted, None);

        let pod: KubernetesEntityState = host
            .get_as(&EntityKind::Pod.entity_link("p1"))
            .await
            .unwrap();
        assert_eq!(pod.parent_link, HOST);
        assert_eq!(pod.tenant_links, vec!["/tenants/t1".to_string()]);
        assert!(pod.description_link.starts_with(DISCOVERED_DESCRIPTION_LINK));
        let group = pod.composite_component_link.unwrap();
        assert!(host.get(&group).await.is_ok());
        assert!(!collection.is_collecting(HOST));
    }

    #[tokio::test]
    async fn entities_gone_from_the_host_are_deleted_and_listed_ones_kept() {
        let (host, collection) = setup(EntityListing::default().with_entity("p1", "web", "Pod")).await;
        for id in ["p1", "p2"] {
            let entity = KubernetesEntityState {
                document_self_link: EntityKind::Pod.entity_link(id),
                id: id.to_string(),
                name: id.to_string(),
                entity_type: Some(EntityKind::Pod),
                parent_link: HOST.to_string(),
                ..KubernetesEntityState::default()
            };
            host.post(
                EntityKind::Pod.factory_link(),
                serde_json::to_value(&entity).unwrap(),
            )
            .await
            .unwrap();
        }

        let report = run(&collection).await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.created, 0);
        assert!(host.get(&EntityKind::Pod.entity_link("p1")).await.is_ok());
        assert!(
            host.get(&EntityKind::Pod.entity_link("p2"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn unknown_kinds_and_unnamed_entities_are_skipped() {
        let listing = EntityListing::default()
            .with_entity("c1", "nightly", "CronJob")
            .with_entity("p1", "", "Pod")
            .with_entity("n1", "default", "Namespace");
        let (_, collection) = setup(listing).await;

        let report = run(&collection).await;
        assert_eq!(report.skipped, 2);
        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn missing_host_aborts_and_releases_the_guard() {
        let host = TaskHost::builder().build().unwrap();
        let adapter = SandboxEntityListing::default();
        adapter.set_listing(HOST, EntityListing::default().with_entity("p1", "web", "Pod"));
        let collection = EntityDataCollection::new(host, Arc::new(adapter));

        let report = run(&collection).await;
        assert!(report.aborted.is_some());
        assert!(!collection.is_collecting(HOST));
    }

    #[tokio::test]
    async fn trigger_without_host_is_ignored() {
        let (_, collection) = setup(EntityListing::default()).await;
        assert!(matches!(collection.trigger(None), TriggerOutcome::Ignored));
        assert!(matches!(collection.trigger(Some("  ")), TriggerOutcome::Ignored));
    }
}
