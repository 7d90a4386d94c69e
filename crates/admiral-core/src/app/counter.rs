//! Counter sub-task - 子タスク N 個の fan-in
//!
//! 子タスクの callback は親ではなく counter を指します。
//!
//! # フロー
//! - FINISHED の報告ごとに残り件数を減らす
//! - 0 になったら親へ成功の target を送る
//! - 最初の FAILED で親へ失敗の target を送る
//!
//! どちらの場合も親への通知はちょうど 1 回です。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, info, info_span, warn};

use super::host::{Command, Owner, TaskHost};
use super::registry::FactoryService;
use crate::domain::links::normalize_self_link;
use crate::domain::{ServiceTaskCallback, TaskInfo, TaskStage};
use crate::error::{AdmiralError, Result};

pub const COUNTER_FACTORY_LINK: &str = "/core/counter-subtasks";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterSubTaskState {
    #[serde(default)]
    pub document_self_link: String,
    #[serde(default)]
    pub task_info: TaskInfo,
    pub completions_remaining: u64,
    pub service_task_callback: ServiceTaskCallback,
}

impl CounterSubTaskState {
    pub fn new(count: u64, parent: ServiceTaskCallback) -> Self {
        Self {
            document_self_link: String::new(),
            task_info: TaskInfo::default(),
            completions_remaining: count,
            service_task_callback: parent,
        }
    }
}

/// Report a child sends to the counter (a callback response).
#[derive(Debug, Deserialize)]
struct ChildReport {
    stage: TaskStage,
    #[serde(default)]
    failure_message: Option<String>,
}

pub struct CounterSubTaskFactory;

#[async_trait]
impl FactoryService for CounterSubTaskFactory {
    async fn create(&self, host: &TaskHost, factory_link: &str, body: Value) -> Result<Value> {
        let mut state: CounterSubTaskState = serde_json::from_value(body)
            .map_err(|e| AdmiralError::validation(format!("malformed counter sub-task: {e}")))?;
        if state.completions_remaining == 0 {
            return Err(AdmiralError::validation(
                "counter sub-task needs at least one completion",
            ));
        }
        state.service_task_callback.target_link()?;
        state.document_self_link =
            normalize_self_link(factory_link, &state.document_self_link, || {
                host.id_generator().generate_id()
            });
        state.task_info.stage = TaskStage::Started;

        let stored = host
            .store()
            .create(factory_link, serde_json::to_value(&state)?)
            .await?;

        let (commands, rx) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(stored.body.clone());
        host.attach(
            &state.document_self_link,
            Owner {
                commands,
                snapshots: snapshot_rx,
            },
        );
        let span = info_span!("counter", link = %state.document_self_link);
        let counter = CounterActor {
            host: host.clone(),
            state,
            snapshots,
        };
        tokio::spawn(counter.run(rx).instrument(span));
        Ok(stored.body)
    }
}

struct CounterActor {
    host: TaskHost,
    state: CounterSubTaskState,
    snapshots: watch::Sender<Value>,
}

impl CounterActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut released = false;
        while let Some(command) = commands.recv().await {
            match command {
                Command::Patch { body, referer, reply } => {
                    let result = self.handle_report(body, referer.as_deref()).await;
                    let _ = reply.send(result);
                }
                Command::Get { reply } => {
                    let _ = reply.send(self.snapshots.borrow().clone());
                }
                Command::Delete { reply } => {
                    let result = match self.host.store().delete(&self.state.document_self_link).await {
                        Err(e) if e.is_not_found() => Ok(()),
                        other => other,
                    };
                    self.host.detach(&self.state.document_self_link);
                    let _ = reply.send(result);
                    return;
                }
            }
            if !released && self.state.task_info.stage.is_terminal() {
                self.host.detach(&self.state.document_self_link);
                commands.close();
                released = true;
                debug!("counter resolved, released from the host");
            }
        }
        if !released {
            self.host.detach(&self.state.document_self_link);
        }
    }

    async fn handle_report(&mut self, body: Value, referer: Option<&str>) -> Result<Value> {
        let report: ChildReport = serde_json::from_value(body)
            .map_err(|e| AdmiralError::validation(format!("malformed child report: {e}")))?;

        if self.state.task_info.stage.is_terminal() {
            debug!(referer, stage = %report.stage, "counter already resolved, report ignored");
            return Ok(self.snapshots.borrow().clone());
        }

        let response = match report.stage {
            TaskStage::Finished => {
                self.state.completions_remaining = self.state.completions_remaining.saturating_sub(1);
                debug!(referer, remaining = self.state.completions_remaining, "child finished");
                if self.state.completions_remaining > 0 {
                    None
                } else {
                    self.state.task_info.stage = TaskStage::Finished;
                    Some(self.state.service_task_callback.finished_response())
                }
            }
            TaskStage::Failed | TaskStage::Cancelled => {
                warn!(referer, failure = report.failure_message.as_deref().unwrap_or_default(), "child failed");
                self.state.task_info =
                    TaskInfo::failed(report.failure_message.clone().unwrap_or_default());
                Some(
                    self.state
                        .service_task_callback
                        .failed_response(report.failure_message),
                )
            }
            TaskStage::Created | TaskStage::Started => {
                debug!(referer, stage = %report.stage, "non-terminal report ignored");
                None
            }
        };

        let value = serde_json::to_value(&self.state)?;
        self.host
            .store()
            .patch(&self.state.document_self_link, value.clone())
            .await?;
        self.snapshots.send_replace(value.clone());

        if let Some(response) = response {
            let parent = self.state.service_task_callback.target_link()?.to_string();
            let host = self.host.clone();
            let link = self.state.document_self_link.clone();
            info!(parent = %parent, stage = %response.stage, "counter resolved, notifying parent");
            tokio::spawn(
                async move {
                    let body = match serde_json::to_value(&response) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!(error = %e, "cannot encode counter response");
                            return;
                        }
                    };
                    if let Err(e) = host.patch_from(&parent, body, Some(&link)).await {
                        warn!(parent = %parent, error = %e, "notifying parent failed");
                    }
                }
                .in_current_span(),
            );
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultSubStage, ServiceTaskCallbackResponse};
    use serde_json::json;
    use std::time::Duration;

    async fn setup(count: u64) -> (TaskHost, String, String) {
        let host = TaskHost::builder().build().unwrap();
        let parent = host
            .post("/plain/parents", json!({ "document_self_link": "p" }))
            .await
            .unwrap();
        let parent_link = parent["document_self_link"].as_str().unwrap().to_string();
        let callback = ServiceTaskCallback::create(
            parent_link.clone(),
            TaskStage::Started,
            DefaultSubStage::Completed,
            TaskStage::Started,
            DefaultSubStage::Error,
        );
        let counter = host
            .post(
                COUNTER_FACTORY_LINK,
                serde_json::to_value(CounterSubTaskState::new(count, callback)).unwrap(),
            )
            .await
            .unwrap();
        let counter_link = counter["document_self_link"].as_str().unwrap().to_string();
        (host, parent_link, counter_link)
    }

    fn report(stage: TaskStage) -> Value {
        serde_json::to_value(ServiceTaskCallbackResponse::new(stage, None)).unwrap()
    }

    async fn parent_sub_stage(host: &TaskHost, parent: &str) -> Option<String> {
        for _ in 0..100 {
            let body = host.get(parent).await.unwrap();
            if let Some(sub) = body.get("sub_stage").and_then(Value::as_str) {
                return Some(sub.to_string());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn zero_count_is_a_validation_error() {
        let host = TaskHost::builder().build().unwrap();
        let callback = ServiceTaskCallback::create_with_stages(
            "/p",
            TaskStage::Finished,
            TaskStage::Failed,
        );
        let err = host
            .post(
                COUNTER_FACTORY_LINK,
                serde_json::to_value(CounterSubTaskState::new(0, callback)).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdmiralError::Validation(_)));
    }

    #[tokio::test]
    async fn parent_is_notified_after_the_last_child() {
        let (host, parent, counter) = setup(3).await;
        for _ in 0..2 {
            host.patch(&counter, report(TaskStage::Finished)).await.unwrap();
        }
        let state: CounterSubTaskState = host.get_as(&counter).await.unwrap();
        assert_eq!(state.completions_remaining, 1);
        assert_eq!(state.task_info.stage, TaskStage::Started);

        host.patch(&counter, report(TaskStage::Finished)).await.unwrap();
        assert_eq!(parent_sub_stage(&host, &parent).await.as_deref(), Some("COMPLETED"));
    }

    #[tokio::test]
    async fn first_failure_wins_and_later_reports_are_ignored() {
        let (host, parent, counter) = setup(3).await;
        host.patch(&counter, report(TaskStage::Failed)).await.unwrap();
        host.patch(&counter, report(TaskStage::Finished)).await.unwrap();
        host.patch(&counter, report(TaskStage::Finished)).await.unwrap();

        let state: CounterSubTaskState = host.get_as(&counter).await.unwrap();
        assert_eq!(state.task_info.stage, TaskStage::Failed);
        assert_eq!(state.completions_remaining, 3);
        assert_eq!(parent_sub_stage(&host, &parent).await.as_deref(), Some("ERROR"));
    }

    #[tokio::test]
    async fn resolved_counter_is_released_from_the_host() {
        let (host, parent, counter) = setup(1).await;
        assert!(host.is_running(&counter));
        host.patch(&counter, report(TaskStage::Finished)).await.unwrap();
        assert_eq!(parent_sub_stage(&host, &parent).await.as_deref(), Some("COMPLETED"));
        assert!(!host.is_running(&counter));

        // Late reports hit the stored document and change nothing.
        let late = host.patch(&counter, report(TaskStage::Failed)).await.unwrap();
        assert_eq!(late["task_info"]["stage"], "FINISHED");
        let state: CounterSubTaskState = host.get_as(&counter).await.unwrap();
        assert_eq!(state.completions_remaining, 0);
    }
}
