//! Task engine - タスク document を CREATED から終端 stage まで進める
//!
//! # 設計
//! - 生きているタスク document 1 つにつき 1 actor（unbounded な command queue）
//! - 変更はすべて patch（通常は self-patch）として届き、commit 前に
//!   [`transition::evaluate`] で現在の状態と照合される
//! - commit のたびに dispatch: STARTED なら handler を spawn、
//!   FINISHED/FAILED なら親へ通知し、host から切り離す
//!
//! handler は document を直接書き換えません。次の状態を決めて自分に送るので、
//! すべての遷移が同じ検証を通ります。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, info, info_span, warn};

use super::context::TaskContext;
use super::host::{Command, Owner, TaskHost};
use super::registry::FactoryService;
use crate::domain::links::normalize_self_link;
use crate::domain::transition::{self, Transition};
use crate::domain::{
    DomainEvent, ServiceTaskCallback, ServiceTaskCallbackResponse, SubStage, TaskBody,
    TaskDocument, TaskPatch, TaskStage, TaskStatusView,
};
use crate::error::{AdmiralError, Result};
use crate::ports::Job;

pub type TaskDoc<T> = TaskDocument<<T as TaskService>::SubStage, <T as TaskService>::Body>;

pub type TaskPatchOf<T> =
    TaskPatch<<T as TaskService>::SubStage, <<T as TaskService>::Body as TaskBody>::Patch>;

/// A concrete task type.
///
/// # Example
/// ```ignore
/// struct Ping;
///
/// #[async_trait]
/// impl TaskService for Ping {
///     type SubStage = DefaultSubStage;
///     type Body = EmptyBody;
///     const FACTORY_LINK: &'static str = "/tasks/ping";
///     const DISPLAY_NAME: &'static str = "Ping";
///
///     async fn handle_started_stage(&self, ctx: &TaskContext<Self>, state: TaskDoc<Self>) -> Result<()> {
///         match state.task_sub_stage {
///             DefaultSubStage::Created => ctx.proceed_to(DefaultSubStage::Completed),
///             DefaultSubStage::Completed => ctx.complete(),
///             DefaultSubStage::Error => ctx.complete_with_error(),
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskService: Send + Sync + Sized + 'static {
    type SubStage: SubStage;
    type Body: TaskBody;

    const FACTORY_LINK: &'static str;
    const DISPLAY_NAME: &'static str;

    /// Reject or correct the initial document. Runs once, before STARTED;
    /// an error is returned to the creator and nothing is persisted.
    fn validate_state_on_start(&self, _state: &mut TaskDoc<Self>) -> Result<()> {
        Ok(())
    }

    /// Work for the current sub-stage. Must end every path by sending a
    /// self-patch (or by arranging for children to send one). An `Err`
    /// fails the task.
    async fn handle_started_stage(&self, ctx: &TaskContext<Self>, state: TaskDoc<Self>)
    -> Result<()>;

    fn finished_callback_response(&self, state: &TaskDoc<Self>) -> ServiceTaskCallbackResponse {
        state.service_task_callback.finished_response()
    }

    fn failed_callback_response(&self, state: &TaskDoc<Self>) -> ServiceTaskCallbackResponse {
        state
            .service_task_callback
            .failed_response(state.task_info.failure_message.clone())
    }
}

/// Type-erased factory for one [`TaskService`].
pub struct TaskFactory<T: TaskService> {
    service: Arc<T>,
}

impl<T: TaskService> TaskFactory<T> {
    pub fn new(service: T) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

#[async_trait]
impl<T: TaskService> FactoryService for TaskFactory<T> {
    async fn create(&self, host: &TaskHost, factory_link: &str, body: Value) -> Result<Value> {
        let mut state: TaskDoc<T> = serde_json::from_value(body).map_err(|e| {
            AdmiralError::validation(format!("{}: malformed task: {e}", T::DISPLAY_NAME))
        })?;
        state.document_self_link =
            normalize_self_link(factory_link, &state.document_self_link, || {
                host.id_generator().generate_id()
            });

        // Terminal documents are stored but never restarted.
        let start = !state.stage().is_terminal();
        if start {
            self.service.validate_state_on_start(&mut state)?;
            if state.stage() == TaskStage::Created {
                state.task_info.stage = TaskStage::Started;
            }
        }
        state.document_version = 1;
        state.document_update_time = Some(host.clock().now());

        let stored = host
            .store()
            .create(factory_link, serde_json::to_value(&state)?)
            .await?;
        host.emit(DomainEvent::TaskCreated {
            link: stored.link.clone(),
            factory_link: factory_link.to_string(),
        });
        if start {
            TaskActor::spawn(host.clone(), self.service.clone(), state, stored.body.clone());
        }
        Ok(stored.body)
    }
}

struct TaskActor<T: TaskService> {
    host: TaskHost,
    service: Arc<T>,
    ctx: TaskContext<T>,
    state: TaskDoc<T>,
    snapshots: watch::Sender<Value>,
    /// Set when the terminal notification has been handed off.
    notified: bool,
}

impl<T: TaskService> TaskActor<T> {
    fn spawn(host: TaskHost, service: Arc<T>, state: TaskDoc<T>, snapshot: Value) {
        let link = state.document_self_link.clone();
        let (commands, rx) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(snapshot);
        host.attach(
            &link,
            Owner {
                commands,
                snapshots: snapshot_rx,
            },
        );

        let actor = Self {
            ctx: TaskContext::new(host.clone(), service.clone(), link.clone()),
            host,
            service,
            state,
            snapshots,
            notified: false,
        };
        let span = info_span!("task", task = T::DISPLAY_NAME, link = %link);
        tokio::spawn(actor.run(rx).instrument(span));
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.dispatch();
        let mut released = false;
        while let Some(command) = commands.recv().await {
            match command {
                Command::Patch {
                    body,
                    referer,
                    reply,
                } => {
                    let result = self.handle_patch(body, referer.as_deref()).await;
                    let _ = reply.send(result);
                }
                Command::Get { reply } => {
                    let _ = reply.send(self.snapshots.borrow().clone());
                }
                Command::Delete { reply } => {
                    let result = self.handle_delete().await;
                    let _ = reply.send(result);
                    return;
                }
            }
            // A terminal document is answered from the store from now on;
            // commands already queued are still served.
            if !released && self.state.stage().is_terminal() {
                self.host.detach(self.link());
                commands.close();
                released = true;
                debug!("terminal, released from the host");
            }
        }
        if !released {
            self.host.detach(self.link());
        }
    }

    fn link(&self) -> &str {
        &self.state.document_self_link
    }

    async fn handle_patch(&mut self, body: Value, referer: Option<&str>) -> Result<Value> {
        let patch: TaskPatchOf<T> = serde_json::from_value(body)
            .map_err(|e| AdmiralError::validation(format!("malformed patch: {e}")))?;
        let current = self.state.task_state();

        match transition::evaluate(&current, patch.stage, patch.sub_stage) {
            Transition::Ignore(reason) => {
                debug!(referer, %reason, "patch ignored");
                self.host.emit(DomainEvent::PatchIgnored {
                    link: self.link().to_string(),
                    reason,
                });
                Ok(self.snapshots.borrow().clone())
            }
            Transition::Reject(reason) => {
                warn!(referer, %reason, "patch rejected");
                self.host.emit(DomainEvent::PatchRejected {
                    link: self.link().to_string(),
                    reason: reason.clone(),
                });
                Err(AdmiralError::InvalidTransition(reason))
            }
            Transition::Violation(reason) => {
                warn!(referer, %reason, "illegal sub-stage skip");
                self.host.emit(DomainEvent::PatchRejected {
                    link: self.link().to_string(),
                    reason: reason.clone(),
                });
                self.ctx
                    .fail_task(&format!("{} failed: {reason}", T::DISPLAY_NAME), None);
                Err(AdmiralError::InvalidTransition(reason))
            }
            Transition::MergeOnly => {
                let mut next = self.state.clone();
                next.merge_data(&patch);
                self.commit(next).await
            }
            Transition::Apply => {
                let mut next = self.state.clone();
                next.apply(&patch);
                let value = self.commit(next).await?;
                self.log_transition(&current, referer);
                self.dispatch();
                Ok(value)
            }
        }
    }

    /// Persist `next`, then make it the current state.
    async fn commit(&mut self, mut next: TaskDoc<T>) -> Result<Value> {
        next.document_version = self.state.document_version + 1;
        next.document_update_time = Some(self.host.clock().now());
        let value = serde_json::to_value(&next)?;
        self.host.store().patch(self.link(), value.clone()).await?;

        self.state = next;
        self.snapshots.send_replace(value.clone());
        if let Some(tracker) = self.state.request_tracker_link.clone() {
            self.update_request_tracker(tracker);
        }
        Ok(value)
    }

    fn log_transition(&self, from: &crate::domain::TaskState<T::SubStage>, referer: Option<&str>) {
        let to_stage = self.state.stage();
        let to_sub_stage = self.state.task_sub_stage;
        if self.host.config().orchestrator.log_transitions_at_debug() {
            debug!(from = %from, stage = %to_stage, sub_stage = %to_sub_stage.name(), referer, "transition");
        } else {
            info!(from = %from, stage = %to_stage, sub_stage = %to_sub_stage.name(), referer, "transition");
        }
        self.host.emit(DomainEvent::StateChanged {
            link: self.link().to_string(),
            from_stage: from.stage,
            from_sub_stage: from.sub_stage.name(),
            from_ordinal: from.sub_stage.ordinal(),
            to_stage,
            to_sub_stage: to_sub_stage.name(),
            to_ordinal: to_sub_stage.ordinal(),
        });
    }

    fn dispatch(&mut self) {
        let state = self.state.clone();
        match state.stage() {
            TaskStage::Created | TaskStage::Started => {
                let ctx = self.ctx.clone();
                let service = self.service.clone();
                tokio::spawn(
                    async move {
                        let sub_stage = state.task_sub_stage;
                        if let Err(e) = service.handle_started_stage(&ctx, state).await {
                            ctx.fail_task(
                                &format!(
                                    "{} failed in sub-stage {}",
                                    T::DISPLAY_NAME,
                                    sub_stage.name()
                                ),
                                Some(&e),
                            );
                        }
                    }
                    .in_current_span(),
                );
            }
            TaskStage::Finished => {
                info!("task finished");
                let response = self.service.finished_callback_response(&state);
                self.notify_parent(response, self.host.config().orchestrator.self_delete);
            }
            TaskStage::Failed => {
                warn!(
                    failure = state.task_info.failure_message.as_deref().unwrap_or_default(),
                    "task failed"
                );
                let response = self.service.failed_callback_response(&state);
                self.notify_parent(response, self.host.config().orchestrator.self_delete);
            }
            TaskStage::Cancelled => {
                info!("task cancelled");
            }
        }
    }

    /// Hand the terminal response to the parent. Runs at most once per task.
    fn notify_parent(&mut self, mut response: ServiceTaskCallbackResponse, self_delete: bool) {
        if self.notified {
            return;
        }
        self.notified = true;

        for (key, value) in &self.state.custom_properties {
            response
                .custom_properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        let host = self.host.clone();
        let link = self.link().to_string();
        let callback = self.state.service_task_callback.clone();
        tokio::spawn(
            async move {
                if let Err(e) = send_callback(&host, &link, &callback, &response).await {
                    warn!(error = %e, "notifying parent failed");
                }
                if self_delete && let Err(e) = host.delete(&link).await {
                    warn!(error = %e, "self-delete failed");
                }
            }
            .in_current_span(),
        );
    }

    async fn handle_delete(&mut self) -> Result<()> {
        let stage = self.state.stage();
        if !stage.is_terminal() {
            warn!(stage = %stage, "task expired");
            let response = self
                .state
                .service_task_callback
                .failed_response(Some(format!("Task expired in stage: {stage}")));
            self.notify_parent(response, false);
        }

        let result = match self.host.store().delete(self.link()).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };
        self.host.detach(self.link());
        self.host.emit(DomainEvent::TaskDeleted {
            link: self.link().to_string(),
        });
        result
    }

    fn update_request_tracker(&self, tracker: String) {
        let view = TaskStatusView::from_task(T::DISPLAY_NAME, &self.state);
        let config = &self.host.config().orchestrator;
        let retries = if view.stage.is_terminal() {
            config.tracker_retries
        } else {
            0
        };
        let job = patch_request_tracker(
            self.host.clone(),
            tracker,
            view,
            retries,
            config.tracker_retry_interval(),
        );
        tokio::spawn(job);
    }
}

async fn send_callback(
    host: &TaskHost,
    link: &str,
    callback: &ServiceTaskCallback,
    response: &ServiceTaskCallbackResponse,
) -> Result<()> {
    if callback.is_empty() {
        return Ok(());
    }
    let parent = callback.target_link()?;
    host.emit(DomainEvent::ParentNotified {
        link: link.to_string(),
        parent_link: parent.to_string(),
        stage: response.stage,
    });
    debug!(parent, stage = %response.stage, "notifying parent");
    host.patch_from(parent, serde_json::to_value(response)?, Some(link))
        .await
        .map(|_| ())
}

fn patch_request_tracker(
    host: TaskHost,
    tracker: String,
    view: TaskStatusView,
    retries_left: u32,
    interval: Duration,
) -> Job {
    Box::pin(async move {
        let body = match serde_json::to_value(&view) {
            Ok(body) => body,
            Err(e) => {
                warn!(tracker = %tracker, error = %e, "cannot encode task status");
                return;
            }
        };
        match host.patch(&tracker, body).await {
            Ok(_) => {}
            Err(e) if retries_left > 0 => {
                debug!(tracker = %tracker, error = %e, retries_left, "request tracker update failed, retrying");
                let retry = patch_request_tracker(
                    host.clone(),
                    tracker,
                    view,
                    retries_left - 1,
                    interval,
                );
                host.schedule(interval, retry);
            }
            Err(e) => {
                warn!(tracker = %tracker, error = %e, "request tracker update failed");
            }
        }
    })
}
