//! admiral-core
//!
//! Self-driving task orchestration for Admiral.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（stage, task document, callback, transition, events）
//! - **ports**: 抽象化レイヤー（DocumentStore, Scheduler, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryDocumentStore, sandbox の request broker など）
//! - **app**: アプリケーションロジック（host, engine, context, poller, counter）
//! - **tasks**: self-provisioning と entity data collection

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod logging;
pub mod ports;
pub mod tasks;

pub use app::{TaskContext, TaskDoc, TaskHost, TaskPatchOf, TaskService};
pub use config::AdmiralConfig;
pub use domain::{
    ServiceTaskCallback, ServiceTaskCallbackResponse, SubStage, TaskDocument, TaskPatch,
    TaskStage, TaskStatusView,
};
pub use error::{AdmiralError, ErrorKind, Result};
