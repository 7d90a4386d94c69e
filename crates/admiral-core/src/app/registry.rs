//! FactoryRegistry - factory link と型消去された factory の対応
//!
//! 型付きの [`TaskService`](super::engine::TaskService) は
//! [`TaskFactory`](super::engine::TaskFactory) で包まれ、
//! `Arc<dyn FactoryService>` として保存されます。host はタスクの型を知らずに
//! POST をルーティングできます。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::host::TaskHost;
use crate::error::Result;

/// Object-safe creation entry point of a factory link.
#[async_trait]
pub trait FactoryService: Send + Sync {
    /// Create (and, for tasks, start) a document. Returns the stored body.
    async fn create(&self, host: &TaskHost, factory_link: &str, body: Value) -> Result<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a factory is already registered at '{0}'")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn FactoryService>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        factory_link: &str,
        factory: Arc<dyn FactoryService>,
    ) -> std::result::Result<(), RegistryError> {
        if self.factories.contains_key(factory_link) {
            return Err(RegistryError::AlreadyRegistered(factory_link.to_string()));
        }
        self.factories.insert(factory_link.to_string(), factory);
        Ok(())
    }

    pub fn get(&self, factory_link: &str) -> Option<Arc<dyn FactoryService>> {
        self.factories.get(factory_link).cloned()
    }

    pub fn registered_links(&self) -> Vec<String> {
        let mut links: Vec<String> = self.factories.keys().cloned().collect();
        links.sort();
        links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl FactoryService for Echo {
        async fn create(&self, _host: &TaskHost, _link: &str, body: Value) -> Result<Value> {
            Ok(body)
        }
    }

    #[test]
    fn double_registration_is_refused() {
        let mut registry = FactoryRegistry::new();
        registry.register("/echo", Arc::new(Echo)).unwrap();
        let err = registry.register("/echo", Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(link) if link == "/echo"));
    }

    #[test]
    fn registered_links_are_sorted() {
        let mut registry = FactoryRegistry::new();
        registry.register("/b", Arc::new(Echo)).unwrap();
        registry.register("/a", Arc::new(Echo)).unwrap();
        assert!(registry.get("/a").is_some());
        assert!(registry.get("/c").is_none());
        assert_eq!(registry.registered_links(), vec!["/a", "/b"]);
    }
}
