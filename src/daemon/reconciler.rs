//! Drives the engine's attached namespaces toward the configured profiles.
//!
//! A pass compares the desired `(profile, namespace)` attachments of every
//! enabled profile against what the state table says the engine has accepted,
//! then issues removals followed by additions. Calls within a pass run
//! concurrently; a failing key only delays itself, under its own retry state.
//!
//! Passes run when the configuration is reloaded, when a profile is enabled or
//! disabled, when the engine (re)enters Running, periodically, and when the
//! earliest pending retry becomes eligible.

use super::backoff::{BackoffEngine, BackoffStep, RetryPolicy, RetryState};
use super::control::EngineControl;
use super::events::{StateCommand, StateCommands};
use super::shutdown::ShutdownHandle;
use super::state::{Attachment, AttachmentKey, AttachmentStatus, StateStore};
use super::supervisor::{EngineState, EngineStatus};
use crate::config::Config;
use crate::error::{DaemonError, Result};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// One namespace attachment a profile wants.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredAttachment {
    pub key: AttachmentKey,
    pub selectors: Vec<String>,
    pub services: Vec<String>,
    pub policy: RetryPolicy,
}

#[derive(Debug, Default, PartialEq)]
pub struct Plan {
    pub removals: Vec<AttachmentKey>,
    pub additions: Vec<DesiredAttachment>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty()
    }
}

/// Attachments wanted by the enabled profiles.
pub fn desired_set(
    config: &Config,
    enabled: &BTreeMap<String, bool>,
) -> BTreeMap<AttachmentKey, DesiredAttachment> {
    let mut out = BTreeMap::new();
    for profile in &config.profiles {
        let on = enabled.get(&profile.name).copied().unwrap_or(profile.enabled);
        if !on {
            continue;
        }
        let policy = profile.retry_settings(&config.defaults).policy();
        for namespace in &profile.namespaces {
            let key = AttachmentKey::new(&profile.name, namespace);
            out.insert(
                key.clone(),
                DesiredAttachment {
                    key,
                    selectors: profile.selectors.clone(),
                    services: profile.services.clone(),
                    policy,
                },
            );
        }
    }
    out
}

/// Difference between desired and tracked attachments. With `fresh_engine`
/// nothing counts as accepted, so every desired attachment is re-added.
pub fn plan(
    desired: &BTreeMap<AttachmentKey, DesiredAttachment>,
    tracked: &BTreeMap<AttachmentKey, Attachment>,
    fresh_engine: bool,
) -> Plan {
    let mut plan = Plan::default();

    for (key, attachment) in tracked {
        match desired.get(key) {
            None => plan.removals.push(key.clone()),
            Some(want) if attachment.selectors != want.selectors => {
                if attachment.status == AttachmentStatus::Added && !fresh_engine {
                    plan.removals.push(key.clone());
                }
            }
            Some(_) => {}
        }
    }

    for (key, want) in desired {
        let needed = match tracked.get(key) {
            None => true,
            Some(_) if fresh_engine => true,
            Some(have) => {
                have.status != AttachmentStatus::Added
                    || have.selectors != want.selectors
                    || have.services != want.services
            }
        };
        if needed {
            plan.additions.push(want.clone());
        }
    }

    plan
}

pub enum ReconcileRequest {
    /// Replace the configuration; profile enablement resets to the file's.
    Reload {
        config: Box<Config>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Enable or disable one profile, or all of them.
    SetEnabled {
        profile: Option<String>,
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::UnboundedSender<ReconcileRequest>,
}

impl ReconcilerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReconcileRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub async fn reload(&self, config: Config) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ReconcileRequest::Reload {
            config: Box::new(config),
            reply,
        })?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn set_enabled(&self, profile: Option<String>, enabled: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ReconcileRequest::SetEnabled {
            profile,
            enabled,
            reply,
        })?;
        rx.await.map_err(|_| stopped())?
    }

    fn send(&self, request: ReconcileRequest) -> Result<()> {
        self.tx.send(request).map_err(|_| stopped())
    }
}

fn stopped() -> DaemonError {
    DaemonError::Protocol("reconciler is not running".to_string())
}

pub struct ProfileReconciler {
    config: Config,
    enabled: BTreeMap<String, bool>,
    control: Arc<dyn EngineControl>,
    store: StateStore,
    commands: StateCommands,
    requests: mpsc::UnboundedReceiver<ReconcileRequest>,
    engine: watch::Receiver<EngineStatus>,
    shutdown: ShutdownHandle,
    /// Per-key retry state; only this task reads or writes it.
    retries: HashMap<AttachmentKey, RetryState>,
    generation: u64,
}

impl ProfileReconciler {
    pub fn new(
        config: Config,
        control: Arc<dyn EngineControl>,
        store: StateStore,
        commands: StateCommands,
        requests: mpsc::UnboundedReceiver<ReconcileRequest>,
        engine: watch::Receiver<EngineStatus>,
        shutdown: ShutdownHandle,
    ) -> Self {
        let enabled = enablement(&config);
        Self {
            config,
            enabled,
            control,
            store,
            commands,
            requests,
            engine,
            shutdown,
            retries: HashMap::new(),
            generation: 0,
        }
    }

    pub async fn run(mut self) {
        info!(profiles = self.config.profiles.len(), "Profile reconciler started");
        self.publish_profiles();

        let mut interval = self.periodic();
        let status = self.engine.borrow_and_update().clone();
        if status.state == EngineState::Running {
            self.on_engine_ready(status.generation).await;
        }

        loop {
            let wake = self.next_retry_at();
            let retry_due = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                Some(request) = self.requests.recv() => {
                    if self.handle_request(request) {
                        interval = self.periodic();
                    }
                    self.pass(false).await;
                }
                changed = self.engine.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = self.engine.borrow_and_update().clone();
                    if status.state == EngineState::Running && status.generation != self.generation {
                        self.on_engine_ready(status.generation).await;
                    }
                }
                _ = interval.tick() => self.pass(false).await,
                _ = retry_due => self.pass(false).await,
                _ = self.shutdown.wait() => break,
            }
        }

        info!("Profile reconciler stopped");
    }

    fn periodic(&self) -> tokio::time::Interval {
        let period = self.config.defaults.reconcile_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Apply a request; returns whether the configuration was replaced.
    fn handle_request(&mut self, request: ReconcileRequest) -> bool {
        match request {
            ReconcileRequest::Reload { config, reply } => {
                info!(profiles = config.profiles.len(), "Configuration reloaded");
                self.config = *config;
                self.enabled = enablement(&self.config);
                self.retries.clear();
                self.publish_profiles();
                let _ = reply.send(Ok(()));
                true
            }
            ReconcileRequest::SetEnabled {
                profile,
                enabled,
                reply,
            } => {
                let result = match profile {
                    Some(name) => match self.enabled.get_mut(&name) {
                        Some(flag) => {
                            info!(profile = %name, enabled, "Profile toggled");
                            *flag = enabled;
                            Ok(())
                        }
                        None => Err(DaemonError::ConfigValidation(format!(
                            "unknown profile '{name}'"
                        ))),
                    },
                    None => {
                        info!(enabled, "All profiles toggled");
                        self.enabled.values_mut().for_each(|flag| *flag = enabled);
                        Ok(())
                    }
                };
                if result.is_ok() {
                    self.retries.clear();
                    self.publish_profiles();
                }
                let _ = reply.send(result);
                false
            }
        }
    }

    async fn on_engine_ready(&mut self, generation: u64) {
        info!(generation, "Engine ready, re-applying desired namespaces");
        self.generation = generation;
        self.retries.clear();
        self.commands.send(StateCommand::ResetAttachments);
        self.pass(true).await;
    }

    fn publish_profiles(&self) {
        let profiles = self
            .config
            .profiles
            .iter()
            .map(|p| {
                let on = self.enabled.get(&p.name).copied().unwrap_or(p.enabled);
                (p.name.clone(), on)
            })
            .collect();
        self.commands.send(StateCommand::SetProfiles(profiles));
    }

    fn next_retry_at(&self) -> Option<Instant> {
        self.retries
            .values()
            .filter(|r| !r.exhausted)
            .filter_map(|r| r.next_eligible_at)
            .min()
    }

    fn eligible(&self, key: &AttachmentKey, now: Instant) -> bool {
        self.retries.get(key).is_none_or(|r| r.is_eligible(now))
    }

    fn policy_for(
        &self,
        key: &AttachmentKey,
        desired: &BTreeMap<AttachmentKey, DesiredAttachment>,
    ) -> RetryPolicy {
        desired
            .get(key)
            .map(|d| d.policy)
            .or_else(|| {
                self.config
                    .profile(&key.profile)
                    .map(|p| p.retry_settings(&self.config.defaults).policy())
            })
            .unwrap_or_else(|| self.config.defaults.retry.policy())
    }

    async fn pass(&mut self, fresh_engine: bool) {
        if self.engine.borrow().state != EngineState::Running {
            debug!("Engine not running, skipping reconciliation");
            return;
        }

        let tracked = self.store.services().attachments;
        let desired = desired_set(&self.config, &self.enabled);
        let planned = plan(&desired, &tracked, fresh_engine);
        if planned.is_empty() {
            return;
        }

        let now = Instant::now();
        let removals: Vec<AttachmentKey> = planned
            .removals
            .into_iter()
            .filter(|k| self.eligible(k, now))
            .collect();
        let additions: Vec<DesiredAttachment> = planned
            .additions
            .into_iter()
            .filter(|d| self.eligible(&d.key, now))
            .collect();
        if removals.is_empty() && additions.is_empty() {
            return;
        }
        info!(
            removals = removals.len(),
            additions = additions.len(),
            "Reconciling namespaces"
        );

        let control = Arc::clone(&self.control);
        let results = join_all(
            removals
                .iter()
                .map(|key| control.remove_namespace(&key.namespace)),
        )
        .await;

        let mut blocked = HashSet::new();
        for (key, result) in removals.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    debug!(profile = %key.profile, namespace = %key.namespace, "Namespace removed");
                    self.retries.remove(&key);
                    self.commands.send(StateCommand::Untrack { key });
                }
                Err(e) => {
                    let policy = self.policy_for(&key, &desired);
                    blocked.insert(key.clone());
                    self.on_failure(key, e, policy);
                }
            }
        }

        let additions: Vec<DesiredAttachment> = additions
            .into_iter()
            .filter(|d| !blocked.contains(&d.key))
            .collect();
        for want in &additions {
            self.commands.send(StateCommand::Track {
                key: want.key.clone(),
                selectors: want.selectors.clone(),
                services: want.services.clone(),
                policy: want.policy,
            });
        }

        let results = join_all(
            additions
                .iter()
                .map(|d| control.add_namespace(&d.key.namespace, &d.selectors)),
        )
        .await;

        for (want, result) in additions.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    debug!(
                        profile = %want.key.profile,
                        namespace = %want.key.namespace,
                        "Namespace attached"
                    );
                    self.retries.remove(&want.key);
                    self.commands.send(StateCommand::Attached { key: want.key });
                }
                Err(e) => self.on_failure(want.key, e, want.policy),
            }
        }
    }

    fn on_failure(&mut self, key: AttachmentKey, error: DaemonError, policy: RetryPolicy) {
        let state = self.retries.remove(&key).unwrap_or_default();

        let (terminal, next) = if error.is_retryable() {
            let (step, next) = BackoffEngine::new(policy).schedule(&state, Instant::now());
            match step {
                BackoffStep::Retry(delay) => {
                    warn!(
                        profile = %key.profile,
                        namespace = %key.namespace,
                        attempt = next.attempts,
                        ?delay,
                        error = %error,
                        "Namespace operation failed, will retry"
                    );
                    (false, next)
                }
                BackoffStep::Exhausted => (true, next),
            }
        } else {
            (
                true,
                RetryState {
                    exhausted: true,
                    ..state
                },
            )
        };

        if terminal {
            warn!(
                profile = %key.profile,
                namespace = %key.namespace,
                kind = error.kind(),
                error = %error,
                "Namespace operation failed permanently"
            );
        }

        self.retries.insert(key.clone(), next);
        self.commands.send(StateCommand::AttachFailed {
            key,
            error: error.to_string(),
            terminal,
        });
    }
}

fn enablement(config: &Config) -> BTreeMap<String, bool> {
    config
        .profiles
        .iter()
        .map(|p| (p.name.clone(), p.enabled))
        .collect()
}
