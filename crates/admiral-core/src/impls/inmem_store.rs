//! InMemoryDocumentStore - プロセス内の document storage
//!
//! # 内部実装
//! - `DashMap<link, StoredDocument>`; 各操作が触れる shard は 1 つ
//! - `create` は entry API を使うので、同じ link への同時 create は
//!   1 つが成功し、残りは `Conflict` になる

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use crate::domain::links::normalize_self_link;
use crate::error::{AdmiralError, Result};
use crate::ports::{
    DocumentStore, IdGenerator, Query, QueryCursor, SELF_LINK_FIELD, StoredDocument,
    SystemClock, UlidGenerator,
};

pub struct InMemoryDocumentStore {
    docs: DashMap<String, StoredDocument>,
    id_generator: Arc<dyn IdGenerator>,
}

impl InMemoryDocumentStore {
    pub fn new(id_generator: Arc<dyn IdGenerator>) -> Self {
        Self {
            docs: DashMap::new(),
            id_generator,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new(Arc::new(UlidGenerator::new(SystemClock)))
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create(&self, factory_link: &str, mut body: Value) -> Result<StoredDocument> {
        let Some(fields) = body.as_object_mut() else {
            return Err(AdmiralError::validation("document body must be a JSON object"));
        };
        let link = normalize_self_link(
            factory_link,
            fields
                .get(SELF_LINK_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default(),
            || self.id_generator.generate_id(),
        );
        fields.insert(SELF_LINK_FIELD.to_string(), Value::String(link.clone()));

        match self.docs.entry(link.clone()) {
            Entry::Occupied(_) => Err(AdmiralError::Conflict(link)),
            Entry::Vacant(slot) => {
                let doc = StoredDocument {
                    link,
                    kind: factory_link.to_string(),
                    version: 1,
                    body,
                };
                slot.insert(doc.clone());
                Ok(doc)
            }
        }
    }

    async fn get(&self, link: &str) -> Result<StoredDocument> {
        self.docs
            .get(link)
            .map(|doc| doc.clone())
            .ok_or_else(|| AdmiralError::NotFound(link.to_string()))
    }

    async fn patch(&self, link: &str, body: Value) -> Result<StoredDocument> {
        let Value::Object(changes) = body else {
            return Err(AdmiralError::validation("patch body must be a JSON object"));
        };
        let mut entry = self
            .docs
            .get_mut(link)
            .ok_or_else(|| AdmiralError::NotFound(link.to_string()))?;

        if let Value::Object(current) = &mut entry.body {
            for (key, value) in changes {
                if value.is_null() || key == SELF_LINK_FIELD {
                    continue;
                }
                current.insert(key, value);
            }
        }
        entry.version += 1;
        Ok(entry.clone())
    }

    async fn delete(&self, link: &str) -> Result<()> {
        self.docs
            .remove(link)
            .map(|_| ())
            .ok_or_else(|| AdmiralError::NotFound(link.to_string()))
    }

    async fn query(&self, query: Query) -> Result<QueryCursor> {
        let mut matched: Vec<StoredDocument> = self
            .docs
            .iter()
            .filter(|doc| query.matches(doc.value()))
            .map(|doc| doc.value().clone())
            .collect();
        matched.sort_by(|a, b| a.link.cmp(&b.link));
        Ok(QueryCursor::from_documents(matched))
    }
}
