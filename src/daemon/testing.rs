//! In-memory engine double for unit tests.

use super::control::{EngineControl, EventStream, RemoteStatus, ServiceSummary};
use super::events::EngineEvent;
use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(String),
    Remove(String),
    List,
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Unreachable,
    Rejected,
}

struct Inner {
    attached: BTreeMap<String, Vec<String>>,
    services: BTreeMap<String, Vec<String>>,
    failures: HashMap<String, (Failure, u32)>,
    subscribers: Vec<mpsc::UnboundedSender<EngineEvent>>,
    calls: Vec<Call>,
    healthy: bool,
}

pub struct FakeEngine {
    inner: Mutex<Inner>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                attached: BTreeMap::new(),
                services: BTreeMap::new(),
                failures: HashMap::new(),
                subscribers: Vec::new(),
                calls: Vec::new(),
                healthy: true,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Services the engine reports for `namespace` once it is attached.
    pub fn set_services(&self, namespace: &str, services: &[&str]) {
        self.lock().services.insert(
            namespace.to_string(),
            services.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn add_namespace_direct(&self, namespace: &str) {
        self.lock().attached.insert(namespace.to_string(), Vec::new());
    }

    /// Make the next `times` add/remove calls for `namespace` fail.
    pub fn fail(&self, namespace: &str, failure: Failure, times: u32) {
        self.lock()
            .failures
            .insert(namespace.to_string(), (failure, times));
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    /// Forget all attachments, as a freshly restarted engine would.
    pub fn restart(&self) {
        let mut inner = self.lock();
        inner.attached.clear();
        inner.subscribers.clear();
    }

    pub fn attached(&self) -> Vec<String> {
        self.lock().attached.keys().cloned().collect()
    }

    pub fn selectors(&self, namespace: &str) -> Option<Vec<String>> {
        self.lock().attached.get(namespace).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| **c == Call::List)
            .count()
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut inner = self.lock();
        inner
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Close every open event stream.
    pub fn drop_subscribers(&self) {
        self.lock().subscribers.clear();
    }

    pub async fn wait_for_subscribers(&self, n: usize) {
        for _ in 0..500 {
            {
                let mut inner = self.lock();
                inner.subscribers.retain(|tx| !tx.is_closed());
                if inner.subscribers.len() >= n {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no subscriber after 5s");
    }

    fn take_failure(&self, inner: &mut Inner, namespace: &str, op: &str) -> Result<()> {
        let Some((failure, remaining)) = inner.failures.get_mut(namespace) else {
            return Ok(());
        };
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        Err(match failure {
            Failure::Unreachable => DaemonError::unreachable(op, "connection refused"),
            Failure::Rejected => DaemonError::ControlRejected {
                operation: op.to_string(),
                status: 422,
                message: "invalid selector".to_string(),
            },
        })
    }
}

#[async_trait]
impl EngineControl for FakeEngine {
    async fn add_namespace(&self, namespace: &str, selectors: &[String]) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(Call::Add(namespace.to_string()));
        self.take_failure(&mut inner, namespace, "add_namespace")?;
        inner
            .attached
            .insert(namespace.to_string(), selectors.to_vec());
        Ok(())
    }

    async fn remove_namespace(&self, namespace: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(Call::Remove(namespace.to_string()));
        self.take_failure(&mut inner, namespace, "remove_namespace")?;
        inner.attached.remove(namespace);
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<ServiceSummary>> {
        let mut inner = self.lock();
        inner.calls.push(Call::List);
        let mut out = Vec::new();
        for namespace in inner.attached.keys() {
            for service in inner.services.get(namespace).into_iter().flatten() {
                out.push(ServiceSummary {
                    namespace: namespace.clone(),
                    service: service.clone(),
                    status: RemoteStatus::Connected,
                    error: None,
                });
            }
        }
        Ok(out)
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.lock().healthy)
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            inner.calls.push(Call::Subscribe);
            inner.subscribers.push(tx);
        }
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        });
        Ok(stream.boxed())
    }
}
