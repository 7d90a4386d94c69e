#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use admiral_core::AdmiralConfig;
use admiral_core::app::TaskHost;
use admiral_core::domain::DomainEvent;
use serde_json::{Value, json};
use tokio::sync::broadcast;

pub const SINK_FACTORY: &str = "/test/sinks";

/// Config with a poller that gives up quickly.
pub fn fast_config(retries: u32) -> AdmiralConfig {
    let mut config = AdmiralConfig::default();
    config.provisioning.wait_retries = retries;
    config.provisioning.wait_delay_secs = 0;
    config
}

pub fn link_of(body: &Value) -> String {
    body["document_self_link"]
        .as_str()
        .expect("document has a link")
        .to_string()
}

/// Plain document that records whatever callbacks patch into it.
pub async fn sink(host: &TaskHost, id: &str) -> String {
    let created = host
        .post(SINK_FACTORY, json!({ "document_self_link": id }))
        .await
        .unwrap();
    link_of(&created)
}

/// Poll `check` until it yields a value or `timeout` passes.
pub async fn eventually<T, F, Fut>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(timeout, async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Everything published so far, without waiting.
pub fn drain_events(events: &mut broadcast::Receiver<DomainEvent>) -> Vec<DomainEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub fn notifications_from(events: &[DomainEvent], link: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, DomainEvent::ParentNotified { link: l, .. } if l == link))
        .count()
}

/// `(from_ordinal, to_ordinal)` of every transition of `link`.
pub fn transitions_of(events: &[DomainEvent], link: &str) -> Vec<(usize, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            DomainEvent::StateChanged {
                link: l,
                from_ordinal,
                to_ordinal,
                ..
            } if l == link => Some((*from_ordinal, *to_ordinal)),
            _ => None,
        })
        .collect()
}
