//! DocumentStore port - すべての document の正本
//!
//! document は link で指定される JSON object です。document の `kind` は
//! 作成時の factory link で、query はこれで絞り込みます。

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Field holding a document's own link inside its JSON body.
pub const SELF_LINK_FIELD: &str = "document_self_link";

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub link: String,
    pub kind: String,
    pub version: u64,
    pub body: Value,
}

impl StoredDocument {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Top-level field equals the value.
    Eq { field: String, value: Value },
    /// Top-level field equals one of the values.
    In { field: String, values: Vec<Value> },
}

impl Clause {
    pub fn matches(&self, body: &Value) -> bool {
        match self {
            Self::Eq { field, value } => body.get(field) == Some(value),
            Self::In { field, values } => body
                .get(field)
                .is_some_and(|actual| values.iter().any(|v| v == actual)),
        }
    }
}

/// Kind filter (any of) plus clauses (all of).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub kinds: Vec<String>,
    pub clauses: Vec<Clause>,
}

impl Query {
    pub fn of_kind(kind: impl Into<String>) -> Self {
        Self {
            kinds: vec![kind.into()],
            clauses: Vec::new(),
        }
    }

    pub fn of_kinds<I, K>(kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
            clauses: Vec::new(),
        }
    }

    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn field_in<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.clauses.push(Clause::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn matches(&self, doc: &StoredDocument) -> bool {
        (self.kinds.is_empty() || self.kinds.iter().any(|k| *k == doc.kind))
            && self.clauses.iter().all(|c| c.matches(&doc.body))
    }
}

/// One step of a query cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryItem {
    Document(StoredDocument),
    /// The cursor is exhausted. Distinct from an error.
    NoMoreResults,
}

/// Lazily consumed query result.
pub struct QueryCursor {
    source: CursorSource,
}

enum CursorSource {
    Buffered(VecDeque<StoredDocument>),
    Streaming(mpsc::Receiver<Result<StoredDocument>>),
}

impl QueryCursor {
    pub fn from_documents(docs: impl IntoIterator<Item = StoredDocument>) -> Self {
        Self {
            source: CursorSource::Buffered(docs.into_iter().collect()),
        }
    }

    /// Cursor fed by a producer task; a closed channel ends the sequence.
    pub fn from_receiver(rx: mpsc::Receiver<Result<StoredDocument>>) -> Self {
        Self {
            source: CursorSource::Streaming(rx),
        }
    }

    pub async fn next(&mut self) -> Result<QueryItem> {
        match &mut self.source {
            CursorSource::Buffered(docs) => Ok(docs
                .pop_front()
                .map_or(QueryItem::NoMoreResults, QueryItem::Document)),
            CursorSource::Streaming(rx) => match rx.recv().await {
                Some(doc) => doc.map(QueryItem::Document),
                None => Ok(QueryItem::NoMoreResults),
            },
        }
    }

    /// Drain the cursor. Stops at the first error.
    pub async fn collect_all(mut self) -> Result<Vec<StoredDocument>> {
        let mut out = Vec::new();
        while let QueryItem::Document(doc) = self.next().await? {
            out.push(doc);
        }
        Ok(out)
    }
}

/// Persistent document storage.
///
/// # Contract
/// - `create` fails with `Conflict` if the link is taken
/// - `get`, `patch` and `delete` fail with `NotFound` for unknown links
/// - `patch` is a shallow JSON merge; `null` members are ignored
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a new document under `factory_link`. The link is taken from
    /// the body's `document_self_link` (absolute or relative to the factory)
    /// or generated.
    async fn create(&self, factory_link: &str, body: Value) -> Result<StoredDocument>;

    async fn get(&self, link: &str) -> Result<StoredDocument>;

    async fn patch(&self, link: &str, body: Value) -> Result<StoredDocument>;

    async fn delete(&self, link: &str) -> Result<()>;

    async fn query(&self, query: Query) -> Result<QueryCursor>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(link: &str, kind: &str, body: Value) -> StoredDocument {
        StoredDocument {
            link: link.to_string(),
            kind: kind.to_string(),
            version: 1,
            body,
        }
    }

    #[test]
    fn query_filters_on_kind_and_clauses() {
        let pod = doc("/k/pods/a", "/k/pods", json!({ "parent_link": "/h/1" }));
        let svc = doc("/k/services/b", "/k/services", json!({ "parent_link": "/h/2" }));

        let q = Query::of_kinds(["/k/pods", "/k/services"]).field_eq("parent_link", "/h/1");
        assert!(q.matches(&pod));
        assert!(!q.matches(&svc));

        let q = Query::default().field_in("parent_link", ["/h/1", "/h/2"]);
        assert!(q.matches(&pod));
        assert!(q.matches(&svc));
    }

    #[tokio::test]
    async fn buffered_cursor_ends_with_no_more_results() {
        let mut cursor = QueryCursor::from_documents(vec![doc("/a/1", "/a", json!({}))]);
        assert!(matches!(cursor.next().await.unwrap(), QueryItem::Document(_)));
        assert_eq!(cursor.next().await.unwrap(), QueryItem::NoMoreResults);
        assert_eq!(cursor.next().await.unwrap(), QueryItem::NoMoreResults);
    }

    #[tokio::test]
    async fn streaming_cursor_surfaces_errors_separately() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(doc("/a/1", "/a", json!({})))).await.unwrap();
        tx.send(Err(crate::error::AdmiralError::remote("lost")))
            .await
            .unwrap();
        drop(tx);

        let mut cursor = QueryCursor::from_receiver(rx);
        assert!(matches!(cursor.next().await.unwrap(), QueryItem::Document(_)));
        assert!(cursor.next().await.is_err());
        assert_eq!(cursor.next().await.unwrap(), QueryItem::NoMoreResults);
    }
}
