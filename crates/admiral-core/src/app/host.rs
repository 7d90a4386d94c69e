//! TaskHost - document のアドレッシングとルーティング
//!
//! すべての操作は link で document を指定します。実行中のタスクが持つ link は
//! そのタスクの command queue へ送られるため、タスクが自分の document の
//! 唯一の writer になります。それ以外の link は store へ直接届きます。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use super::registry::FactoryRegistry;
use crate::config::AdmiralConfig;
use crate::domain::{DomainEvent, TaskStage};
use crate::error::{AdmiralError, Result};
use crate::ports::{Clock, DocumentStore, IdGenerator, Job, Query, QueryCursor, Scheduler};

const EVENT_CAPACITY: usize = 1024;

/// Request processed by a task's actor loop, one at a time.
pub(crate) enum Command {
    Patch {
        body: Value,
        referer: Option<String>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Get {
        reply: oneshot::Sender<Value>,
    },
    Delete {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle on a running task: its command queue and its latest state.
#[derive(Clone)]
pub(crate) struct Owner {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) snapshots: watch::Receiver<Value>,
}

pub(crate) struct HostParts {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) id_generator: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: AdmiralConfig,
    pub(crate) registry: FactoryRegistry,
}

struct HostInner {
    store: Arc<dyn DocumentStore>,
    scheduler: Arc<dyn Scheduler>,
    id_generator: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: AdmiralConfig,
    registry: FactoryRegistry,
    owners: DashMap<String, Owner>,
    events: broadcast::Sender<DomainEvent>,
}

/// Cheap to clone; all clones share one host.
#[derive(Clone)]
pub struct TaskHost {
    inner: Arc<HostInner>,
}

impl TaskHost {
    pub fn builder() -> super::builder::HostBuilder {
        super::builder::HostBuilder::new()
    }

    pub(crate) fn from_parts(parts: HostParts) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(HostInner {
                store: parts.store,
                scheduler: parts.scheduler,
                id_generator: parts.id_generator,
                clock: parts.clock,
                config: parts.config,
                registry: parts.registry,
                owners: DashMap::new(),
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.inner.id_generator
    }

    pub fn config(&self) -> &AdmiralConfig {
        &self.inner.config
    }

    pub fn registered_factories(&self) -> Vec<String> {
        self.inner.registry.registered_links()
    }

    /// Create a document under `factory_link`.
    ///
    /// Registered factories (tasks, brokers) decide what creation means;
    /// anything else is stored as a plain document.
    pub async fn post(&self, factory_link: &str, body: Value) -> Result<Value> {
        match self.inner.registry.get(factory_link) {
            Some(factory) => factory.create(self, factory_link, body).await,
            None => Ok(self.inner.store.create(factory_link, body).await?.body),
        }
    }

    pub async fn patch(&self, link: &str, body: Value) -> Result<Value> {
        self.patch_from(link, body, None).await
    }

    /// Patch with the link of the sender attached (used in logs).
    ///
    /// A task that already reached a terminal stage no longer owns its
    /// link; patches to it are dropped and the stored state is returned.
    pub async fn patch_from(&self, link: &str, body: Value, referer: Option<&str>) -> Result<Value> {
        let Some(reply) = self.enqueue_patch(link, body.clone(), referer) else {
            return self.patch_stored(link, body, referer).await;
        };
        reply
            .await
            .map_err(|_| AdmiralError::TaskUnavailable(link.to_string()))?
    }

    async fn patch_stored(&self, link: &str, body: Value, referer: Option<&str>) -> Result<Value> {
        let current = self.inner.store.get(link).await?.body;
        if stage_of(&current).is_some_and(TaskStage::is_terminal) {
            debug!(link, referer, "document is terminal, patch ignored");
            return Ok(current);
        }
        Ok(self.inner.store.patch(link, body).await?.body)
    }

    /// Put a patch on the owner's queue without waiting for it.
    ///
    /// Patches enqueued by one caller are applied in call order. `None` if no
    /// task owns `link`.
    pub(crate) fn enqueue_patch(
        &self,
        link: &str,
        body: Value,
        referer: Option<&str>,
    ) -> Option<oneshot::Receiver<Result<Value>>> {
        let owner = self.owner(link)?;
        let (reply, rx) = oneshot::channel();
        owner
            .commands
            .send(Command::Patch {
                body,
                referer: referer.map(str::to_string),
                reply,
            })
            .ok()?;
        Some(rx)
    }

    pub async fn get(&self, link: &str) -> Result<Value> {
        if let Some(owner) = self.owner(link) {
            let (reply, rx) = oneshot::channel();
            // A failed send means the task was just released.
            if owner.commands.send(Command::Get { reply }).is_ok() {
                return rx
                    .await
                    .map_err(|_| AdmiralError::TaskUnavailable(link.to_string()));
            }
        }
        Ok(self.inner.store.get(link).await?.body)
    }

    pub async fn get_as<T: DeserializeOwned>(&self, link: &str) -> Result<T> {
        Ok(serde_json::from_value(self.get(link).await?)?)
    }

    pub async fn delete(&self, link: &str) -> Result<()> {
        if let Some(owner) = self.owner(link) {
            let (reply, rx) = oneshot::channel();
            if owner.commands.send(Command::Delete { reply }).is_ok() {
                return rx
                    .await
                    .map_err(|_| AdmiralError::TaskUnavailable(link.to_string()))?;
            }
        }
        self.inner.store.delete(link).await
    }

    pub async fn query(&self, query: Query) -> Result<QueryCursor> {
        self.inner.store.query(query).await
    }

    pub fn schedule(&self, delay: Duration, job: Job) {
        self.inner.scheduler.schedule(delay, job);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: DomainEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn is_running(&self, link: &str) -> bool {
        self.inner.owners.contains_key(link)
    }

    /// Wait until the document at `link` reaches a terminal stage and return
    /// its state at that point.
    pub async fn wait_for_terminal(&self, link: &str) -> Result<Value> {
        let Some(owner) = self.owner(link) else {
            return Ok(self.inner.store.get(link).await?.body);
        };
        let mut snapshots = owner.snapshots;
        drop(owner.commands);
        loop {
            {
                let current = snapshots.borrow_and_update();
                if stage_of(&current).is_some_and(TaskStage::is_terminal) {
                    return Ok(current.clone());
                }
            }
            if snapshots.changed().await.is_err() {
                // The task went away (self-delete); its last state is final.
                let last = snapshots.borrow().clone();
                return Ok(last);
            }
        }
    }

    /// Stop every running task. Documents stay in the store.
    pub fn shutdown(&self) {
        let running = self.inner.owners.len();
        self.inner.owners.clear();
        debug!(running, "host shut down");
    }

    fn owner(&self, link: &str) -> Option<Owner> {
        self.inner.owners.get(link).map(|o| o.clone())
    }

    pub(crate) fn attach(&self, link: &str, owner: Owner) {
        self.inner.owners.insert(link.to_string(), owner);
    }

    pub(crate) fn detach(&self, link: &str) {
        self.inner.owners.remove(link);
    }
}

/// `task_info.stage` of a serialized task document.
pub fn stage_of(body: &Value) -> Option<TaskStage> {
    body.get("task_info")
        .and_then(|info| info.get("stage"))
        .and_then(|stage| serde_json::from_value(stage.clone()).ok())
}
