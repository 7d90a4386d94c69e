//! HostBuilder - [`TaskHost`] の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_factories` で必須の factory link を宣言する
//! - 登録漏れがあれば `build` がエラーを返す（実行時まで持ち越さない）

use std::sync::Arc;

use super::counter::{COUNTER_FACTORY_LINK, CounterSubTaskFactory};
use super::engine::{TaskFactory, TaskService};
use super::host::{HostParts, TaskHost};
use super::registry::{FactoryRegistry, FactoryService, RegistryError};
use crate::config::AdmiralConfig;
use crate::impls::InMemoryDocumentStore;
use crate::ports::{
    Clock, DocumentStore, IdGenerator, Scheduler, SystemClock, TokioScheduler, UlidGenerator,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing factories: {0:?}; they were expected but not registered")]
    MissingFactories(Vec<String>),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct HostBuilder {
    store: Option<Arc<dyn DocumentStore>>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    id_generator: Arc<dyn IdGenerator>,
    config: AdmiralConfig,
    registry: FactoryRegistry,
    pending: Vec<(String, Arc<dyn FactoryService>)>,
    expected: Vec<String>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            scheduler: Arc::new(TokioScheduler),
            clock: Arc::new(SystemClock),
            id_generator: Arc::new(UlidGenerator::new(SystemClock)),
            config: AdmiralConfig::default(),
            registry: FactoryRegistry::new(),
            pending: Vec::new(),
            expected: Vec::new(),
        }
    }

    /// Defaults to an [`InMemoryDocumentStore`] sharing the builder's id
    /// generator.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn config(mut self, config: AdmiralConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a task type under its `FACTORY_LINK`.
    pub fn task<T: TaskService>(mut self, service: T) -> Self {
        self.pending.push((
            T::FACTORY_LINK.to_string(),
            Arc::new(TaskFactory::new(service)),
        ));
        self
    }

    pub fn factory(mut self, factory_link: &str, factory: Arc<dyn FactoryService>) -> Self {
        self.pending.push((factory_link.to_string(), factory));
        self
    }

    pub fn expect_factories(mut self, links: &[&str]) -> Self {
        self.expected.extend(links.iter().map(|l| l.to_string()));
        self
    }

    pub fn build(mut self) -> Result<TaskHost, BuildError> {
        for (link, factory) in self.pending.drain(..) {
            self.registry.register(&link, factory)?;
        }
        // Every task may fan in through counter sub-tasks.
        if self.registry.get(COUNTER_FACTORY_LINK).is_none() {
            self.registry
                .register(COUNTER_FACTORY_LINK, Arc::new(CounterSubTaskFactory))?;
        }

        let registered = self.registry.registered_links();
        let missing: Vec<String> = self
            .expected
            .iter()
            .filter(|link| !registered.contains(link))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingFactories(missing));
        }

        let store = self.store.unwrap_or_else(|| {
            Arc::new(InMemoryDocumentStore::new(self.id_generator.clone()))
        });
        Ok(TaskHost::from_parts(HostParts {
            store,
            scheduler: self.scheduler,
            id_generator: self.id_generator,
            clock: self.clock,
            config: self.config,
            registry: self.registry,
        }))
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_expected_factory_fails_the_build() {
        let err = HostBuilder::new()
            .expect_factories(&["/requests"])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::MissingFactories(m) if m == vec!["/requests".to_string()]));
    }

    #[test]
    fn duplicate_factory_fails_the_build() {
        let err = HostBuilder::new()
            .factory(COUNTER_FACTORY_LINK, Arc::new(CounterSubTaskFactory))
            .factory(COUNTER_FACTORY_LINK, Arc::new(CounterSubTaskFactory))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::Registry(_)));
    }

    #[test]
    fn counter_factory_is_always_registered() {
        let host = HostBuilder::new()
            .expect_factories(&[COUNTER_FACTORY_LINK])
            .build()
            .unwrap();
        assert_eq!(host.registered_factories(), vec![COUNTER_FACTORY_LINK]);
    }
}
