//! Impls - ports のプロセス内実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryDocumentStore**: 開発用の document store
//! - **SandboxRequestBroker / SandboxEntityListing**: リモート協調先の代役

pub mod inmem_store;
pub mod sandbox;

pub use inmem_store::InMemoryDocumentStore;
pub use sandbox::{SandboxBehavior, SandboxEntityListing, SandboxRequestBroker};
