//! Ports - 抽象化レイヤー
//!
//! engine が storage, 時刻, ID, 遅延実行に触れるのはこれらの trait 経由だけです。
//! プロセス内の実装は `impls` にあります。

pub mod clock;
pub mod document_store;
pub mod id_generator;
pub mod scheduler;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::document_store::{
    Clause, DocumentStore, Query, QueryCursor, QueryItem, SELF_LINK_FIELD, StoredDocument,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::scheduler::{Job, Scheduler, TokioScheduler};
