//! TaskContext - handler から使える操作
//!
//! タスクを進める操作はすべて自分自身の link への patch として送られます。
//! 送信は fire-and-forget で、engine が到着順に検証・適用します。
//! 拒否された patch はここではログに残すだけです。

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{Instrument, debug, info, warn};

use super::counter::{COUNTER_FACTORY_LINK, CounterSubTaskState};
use super::engine::{TaskPatchOf, TaskService};
use super::host::TaskHost;
use super::poller::ResourcePoller;
use crate::domain::{ServiceTaskCallback, SubStage, TaskPatch, TaskStage};
use crate::error::{AdmiralError, Result};

pub struct TaskContext<T: TaskService> {
    host: TaskHost,
    service: Arc<T>,
    link: String,
}

impl<T: TaskService> Clone for TaskContext<T> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            service: self.service.clone(),
            link: self.link.clone(),
        }
    }
}

impl<T: TaskService> TaskContext<T> {
    pub(crate) fn new(host: TaskHost, service: Arc<T>, link: String) -> Self {
        Self {
            host,
            service,
            link,
        }
    }

    pub fn host(&self) -> &TaskHost {
        &self.host
    }

    pub fn service(&self) -> &Arc<T> {
        &self.service
    }

    /// The task's own link.
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Id part of the task's link, used to derive deterministic child links.
    pub fn id(&self) -> &str {
        crate::domain::links::get_id(&self.link)
    }

    /// Poller configured from `[provisioning]`.
    pub fn poller(&self) -> ResourcePoller {
        ResourcePoller::from_config(self.host.clone(), &self.host.config().provisioning)
    }

    /// Queue `patch` for this task. Never blocks the caller.
    pub fn send_self_patch(&self, patch: TaskPatchOf<T>) {
        let body = match serde_json::to_value(&patch) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "cannot encode self-patch");
                return;
            }
        };
        let Some(reply) = self.host.enqueue_patch(&self.link, body, Some(&self.link)) else {
            debug!("task is no longer running, self-patch dropped");
            return;
        };
        tokio::spawn(
            async move {
                match reply.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e @ AdmiralError::InvalidTransition(_))) => {
                        debug!(error = %e, "self-patch refused")
                    }
                    Ok(Err(e)) => warn!(error = %e, "self-patch failed"),
                    Err(_) => debug!("task stopped before applying self-patch"),
                }
            }
            .in_current_span(),
        );
    }

    /// Self-patch to `(STARTED, sub_stage)`.
    pub fn proceed_to(&self, sub_stage: T::SubStage) {
        self.send_self_patch(TaskPatch::started(sub_stage));
    }

    /// Self-patch to `(STARTED, sub_stage)` after `configure` filled in data.
    pub fn proceed_to_with<F>(&self, sub_stage: T::SubStage, configure: F)
    where
        F: FnOnce(&mut TaskPatchOf<T>),
    {
        let mut patch = TaskPatch::started(sub_stage);
        configure(&mut patch);
        self.send_self_patch(patch);
    }

    /// `(FINISHED, COMPLETED)`
    pub fn complete(&self) {
        self.send_self_patch(TaskPatch::finished());
    }

    pub fn complete_with(&self, patch: TaskPatchOf<T>) {
        let mut patch = patch;
        patch.stage = TaskStage::Finished;
        patch.sub_stage = Some(T::SubStage::COMPLETED);
        self.send_self_patch(patch);
    }

    /// `(FAILED, ERROR)`, keeping the failure message already recorded.
    ///
    /// Safe to call from several branches at once: the first FAILED patch
    /// wins and the rest are dropped by the engine.
    pub fn complete_with_error(&self) {
        self.send_self_patch(TaskPatch::new(
            TaskStage::Failed,
            Some(T::SubStage::ERROR),
        ));
    }

    /// Log `message` (and the cause) and self-patch to `(FAILED, ERROR)`.
    pub fn fail_task(&self, message: &str, error: Option<&AdmiralError>) {
        let failure = match error {
            Some(e) => format!("{message}: {e}"),
            None => message.to_string(),
        };
        warn!(failure = %failure, "failing task");
        self.send_self_patch(TaskPatch::failed(failure));
    }

    /// Callback that moves this task to `(STARTED, success)` or
    /// `(STARTED, ERROR)`.
    pub fn callback_to_self(&self, success: T::SubStage) -> ServiceTaskCallback {
        ServiceTaskCallback::create(
            self.link.clone(),
            TaskStage::Started,
            success,
            TaskStage::Started,
            T::SubStage::ERROR,
        )
    }

    /// Look up `link`; if it exists go to `next`, otherwise run `create`.
    ///
    /// `create` is responsible for advancing (usually through
    /// [`create_document`](Self::create_document)). Errors other than
    /// `NotFound` are returned so the engine fails the task.
    pub async fn create_if_not_exists<F, Fut>(
        &self,
        link: &str,
        next: T::SubStage,
        create: F,
    ) -> Result<()>
    where
        F: FnOnce(T::SubStage) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match self.host.get(link).await {
            Ok(_) => {
                info!(link, "already exists, skipping creation");
                self.proceed_to(next);
                Ok(())
            }
            Err(e) if e.is_not_found() => create(next).await,
            Err(e) => Err(e),
        }
    }

    /// POST `body` to `factory_link`, then go to `next`.
    ///
    /// A `Conflict` means a concurrent run created the same deterministic
    /// document first; that counts as success.
    pub async fn create_document<B: Serialize>(
        &self,
        factory_link: &str,
        body: &B,
        next: T::SubStage,
    ) -> Result<Value> {
        let value = match self
            .host
            .post(factory_link, serde_json::to_value(body)?)
            .await
        {
            Ok(created) => created,
            Err(AdmiralError::Conflict(link)) => {
                info!(link = %link, "created concurrently, reusing");
                self.host.get(&link).await?
            }
            Err(e) => return Err(e),
        };
        self.proceed_to(next);
        Ok(value)
    }

    /// Callback for `count` children that together move this task to
    /// `(STARTED, success)`.
    ///
    /// One child reports straight back; more share a counter sub-task that
    /// reports once all finished or on the first failure.
    pub async fn create_counter_callback(
        &self,
        count: usize,
        success: T::SubStage,
    ) -> Result<ServiceTaskCallback> {
        let direct = self.callback_to_self(success);
        if count <= 1 {
            return Ok(direct);
        }
        let counter = CounterSubTaskState::new(count as u64, direct);
        let created = self
            .host
            .post(COUNTER_FACTORY_LINK, serde_json::to_value(&counter)?)
            .await?;
        let counter_link = created
            .get("document_self_link")
            .and_then(Value::as_str)
            .ok_or_else(|| AdmiralError::remote("counter sub-task has no link"))?;
        Ok(ServiceTaskCallback::create_with_stages(
            counter_link,
            TaskStage::Finished,
            TaskStage::Failed,
        ))
    }
}
