//! App - アプリケーション層
//!
//! ports を組み合わせてタスクの実行を実装します。
//!
//! # 主要コンポーネント
//! - **TaskHost**: link によるルーティング（生きているタスク or store）
//! - **TaskService / engine**: タスク 1 つにつき 1 actor、patch の検証と dispatch
//! - **TaskContext**: handler から使える操作（self-patch, 子タスクの作成）
//! - **ResourcePoller**: 回数上限つきのポーリング
//! - **CounterSubTaskFactory**: 子タスク N 個の fan-in

pub mod builder;
pub mod context;
pub mod counter;
pub mod engine;
pub mod host;
pub mod join;
pub mod poller;
pub mod registry;

pub use builder::{BuildError, HostBuilder};
pub use context::TaskContext;
pub use counter::{COUNTER_FACTORY_LINK, CounterSubTaskFactory, CounterSubTaskState};
pub use engine::{TaskDoc, TaskFactory, TaskPatchOf, TaskService};
pub use host::{TaskHost, stage_of};
pub use join::{FailOnce, FanIn};
pub use poller::{Condition, PollerConfig, ResourcePoller};
pub use registry::{FactoryRegistry, FactoryService, RegistryError};
