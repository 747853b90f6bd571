use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use log::*;
use solana_sdk::pubkey::Pubkey;
use solana_vault_connector_lib::{
    metrics::{MetricU64, Metrics},
    ConnectionState, SubscriptionHandle, WatchConfig,
};
use tokio::sync::broadcast;

use crate::{
    dispatch::Dispatcher,
    reconnect::{transition, Action, Phase, ReconnectPolicy, Trigger},
    transport::AccountTransport,
    types::{DisconnectReason, UpdateCallback, WatchEvent},
};

struct Entry {
    /// Distinguishes a re-registration of the same account during a pass
    id: u64,
    handle: SubscriptionHandle,
    callback: UpdateCallback,
    /// `handle` no longer delivers updates and needs renewing
    stale: bool,
}

struct WatchState {
    phase: Phase,
    registry: HashMap<Pubkey, Entry>,
    next_entry_id: u64,
    /// A resubscribe pass is scheduled or running
    pass_pending: bool,
    /// Another pass was requested while one was already pending
    pass_rerun: bool,
}

struct StepResult {
    previous: Phase,
    action: Action,
    spawn_pass: bool,
}

enum PassOutcome {
    Completed(StepResult),
    /// The connection dropped mid-pass, so its results cannot be trusted.
    Rerun(Duration),
}

struct Inner {
    transport: Arc<dyn AccountTransport>,
    policy: ReconnectPolicy,
    state: Mutex<WatchState>,
    events: broadcast::Sender<WatchEvent>,
    exit_sender: broadcast::Sender<()>,
    dispatcher: Dispatcher,
    subscribe_failures: MetricU64,
    reconnect_attempts: MetricU64,
    resubscribe_failures: MetricU64,
}

/// Deduplicated, self-healing set of account balance subscriptions.
///
/// Cloning is cheap and every clone drives the same registry. All methods must
/// be called from within a Tokio runtime, since reconnection passes are
/// spawned onto it.
#[derive(Clone)]
pub struct AccountWatcher {
    inner: Arc<Inner>,
}

impl AccountWatcher {
    pub fn new(
        transport: Arc<dyn AccountTransport>,
        config: &WatchConfig,
        metrics: &Metrics,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        let (exit_sender, _) = broadcast::channel(1);
        let dispatcher = Dispatcher::new(
            config.verbose,
            metrics.register_u64("account_updates"),
            metrics.register_u64("callback_failures"),
        );
        AccountWatcher {
            inner: Arc::new(Inner {
                transport,
                policy: ReconnectPolicy::from_config(config),
                state: Mutex::new(WatchState {
                    phase: Phase::Disconnected,
                    registry: HashMap::new(),
                    next_entry_id: 0,
                    pass_pending: false,
                    pass_rerun: false,
                }),
                events,
                exit_sender,
                dispatcher,
                subscribe_failures: metrics.register_u64("subscribe_failures"),
                reconnect_attempts: metrics.register_u64("reconnect_attempts"),
                resubscribe_failures: metrics.register_u64("resubscribe_failures"),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WatchEvent) {
        // Don't care about the error that happens when there are no receivers.
        let _ = self.inner.events.send(event);
    }

    fn step(&self, state: &mut WatchState, trigger: Trigger) -> StepResult {
        let previous = state.phase;
        let (phase, action) = transition(previous, trigger, &self.inner.policy);
        if phase != previous {
            debug!("watcher {:?} -> {:?} on {:?}", previous, phase, trigger);
        }
        state.phase = phase;

        let lost_connection = matches!(phase, Phase::Reconnecting { .. })
            && !matches!(previous, Phase::Reconnecting { .. });
        if lost_connection {
            for entry in state.registry.values_mut() {
                entry.stale = true;
            }
        }

        let wants_pass = matches!(
            action,
            Action::ScheduleResubscribe { .. } | Action::Recovered
        );
        let spawn_pass = wants_pass && !state.pass_pending;
        if spawn_pass {
            state.pass_pending = true;
        } else if wants_pass {
            state.pass_rerun = true;
        }
        StepResult {
            previous,
            action,
            spawn_pass,
        }
    }

    fn perform(&self, step: StepResult, reason: Option<DisconnectReason>) {
        match step.action {
            Action::Nothing => {}
            Action::Connected => {
                info!("account watcher connected");
                self.emit(WatchEvent::Connected);
            }
            Action::Recovered => {
                info!("account watcher connected again, restoring older subscriptions");
                self.emit(WatchEvent::Connected);
                if step.spawn_pass {
                    self.spawn_pass(Duration::ZERO);
                }
            }
            Action::ScheduleResubscribe { attempt, delay } => {
                if !matches!(step.previous, Phase::Reconnecting { .. }) {
                    let reason = reason
                        .unwrap_or_else(|| DisconnectReason::Transport("unknown".to_string()));
                    warn!("account watcher disconnected: {}", reason);
                    self.emit(WatchEvent::Disconnected { reason });
                }
                self.inner.reconnect_attempts.increment();
                info!(
                    "resubscribe attempt {}/{} in {:?}",
                    attempt, self.inner.policy.max_attempts, delay
                );
                self.emit(WatchEvent::Reconnecting { attempt, delay });
                if step.spawn_pass {
                    self.spawn_pass(delay);
                }
            }
            Action::GiveUp => {
                error!(
                    "giving up after {} resubscribe attempts",
                    self.inner.policy.max_attempts
                );
                self.emit(WatchEvent::Disconnected {
                    reason: DisconnectReason::MaxAttempts,
                });
            }
        }
    }

    fn spawn_pass(&self, delay: Duration) {
        let watcher = self.clone();
        let mut exit = self.inner.exit_sender.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = exit.recv() => {
                    debug!("pending resubscribe cancelled by shutdown");
                    return;
                },
                _ = tokio::time::sleep(delay) => {},
            }
            watcher.resubscribe_all().await;
        });
    }

    /// Re-establishes registered subscriptions with their original callbacks.
    ///
    /// While reconnecting every entry is renewed. A pass that finds the
    /// watcher connected only restores the entries left stale by an earlier
    /// failure.
    async fn resubscribe_all(&self) {
        let entries: Vec<(Pubkey, u64, SubscriptionHandle, UpdateCallback)> = {
            let mut state = self.lock();
            // this pass covers whatever was requested before it started
            state.pass_rerun = false;
            let everything = match state.phase {
                Phase::Reconnecting { .. } => true,
                Phase::Connected => false,
                _ => {
                    state.pass_pending = false;
                    return;
                }
            };
            let entries: Vec<_> = state
                .registry
                .iter()
                .filter(|(_, e)| everything || e.stale)
                .map(|(pubkey, e)| (*pubkey, e.id, e.handle, e.callback.clone()))
                .collect();
            if !everything && entries.is_empty() {
                state.pass_pending = false;
                return;
            }
            entries
        };

        debug!("resubscribing {} accounts", entries.len());
        let results = join_all(entries.into_iter().map(|(pubkey, id, old, callback)| {
            self.resubscribe_one(pubkey, id, old, callback)
        }))
        .await;
        let succeeded = results.iter().filter(|ok| **ok).count();
        let failed = results.len() - succeeded;

        let outcome = {
            let mut state = self.lock();
            if state.phase == Phase::Shutdown {
                return;
            }
            if state.pass_rerun {
                state.pass_rerun = false;
                let attempt = state.phase.attempts().max(1);
                PassOutcome::Rerun(self.inner.policy.delay(attempt))
            } else {
                state.pass_pending = false;
                PassOutcome::Completed(
                    self.step(&mut state, Trigger::ResubscribeCompleted { failed }),
                )
            }
        };
        self.inner.resubscribe_failures.add(failed as u64);
        if failed == 0 {
            info!("resubscribed {} accounts", succeeded);
        } else {
            warn!("resubscribed {} accounts, {} failed", succeeded, failed);
        }
        self.emit(WatchEvent::Resubscribed { succeeded, failed });

        match outcome {
            PassOutcome::Completed(step) => self.perform(
                step,
                Some(DisconnectReason::Transport(format!(
                    "{} accounts failed to resubscribe",
                    failed
                ))),
            ),
            PassOutcome::Rerun(delay) => {
                debug!("connection dropped during resubscribe, renewing all in {:?}", delay);
                self.spawn_pass(delay);
            }
        }
    }

    async fn resubscribe_one(
        &self,
        pubkey: Pubkey,
        id: u64,
        old: SubscriptionHandle,
        callback: UpdateCallback,
    ) -> bool {
        let transport = &self.inner.transport;
        if let Err(err) = transport.account_unsubscribe(old).await {
            debug!("dropping stale {} for {}: {:?}", old, pubkey, err);
        }

        let on_change = self.inner.dispatcher.balance_callback(pubkey, callback);
        let handle = match transport.account_subscribe(pubkey, on_change).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!("resubscribe for {} failed: {:?}", pubkey, err);
                if let Some(entry) = self.lock().registry.get_mut(&pubkey) {
                    if entry.id == id && entry.handle == old {
                        entry.stale = true;
                    }
                }
                return false;
            }
        };

        let current = {
            let mut state = self.lock();
            let shut_down = state.phase == Phase::Shutdown;
            match state.registry.get_mut(&pubkey) {
                Some(entry) if !shut_down && entry.id == id && entry.handle == old => {
                    entry.handle = handle;
                    entry.stale = false;
                    true
                }
                _ => false,
            }
        };
        if !current {
            // account went away or was renewed while we were resubscribing
            if let Err(err) = transport.account_unsubscribe(handle).await {
                debug!("cancelling orphaned {} for {}: {:?}", handle, pubkey, err);
            }
        }
        true
    }

    /// Starts watching `pubkey`.
    ///
    /// Returns the existing handle if the account is already watched. Returns
    /// `None` after shutdown or when the transport call fails; a failure starts
    /// the reconnection schedule instead of being reported to the caller.
    ///
    /// Once the watcher has given up, calling this for an account that is
    /// still registered renews it with the callback it was first registered
    /// with, and the remaining stale accounts are restored in the background.
    pub async fn subscribe(
        &self,
        pubkey: Pubkey,
        callback: UpdateCallback,
    ) -> Option<SubscriptionHandle> {
        let restoring = {
            let mut state = self.lock();
            if state.phase == Phase::Shutdown {
                warn!("subscribe for {} ignored after shutdown", pubkey);
                return None;
            }
            let restoring = match state.registry.get(&pubkey) {
                Some(entry) if matches!(state.phase, Phase::Exhausted { .. }) => {
                    debug!("renewing {} for {} after giving up", entry.handle, pubkey);
                    Some((entry.id, entry.handle, entry.callback.clone()))
                }
                Some(entry) => {
                    debug!("{} already subscribed as {}", pubkey, entry.handle);
                    return Some(entry.handle);
                }
                None => None,
            };
            // only moves between phases, never acts
            self.step(&mut state, Trigger::SubscribeStarted);
            restoring
        };
        let (restoring_id, old_handle, callback) = match restoring {
            Some((id, old, stored)) => (Some(id), Some(old), stored),
            None => (None, None, callback),
        };

        let transport = &self.inner.transport;
        let on_change = self
            .inner
            .dispatcher
            .balance_callback(pubkey, callback.clone());
        let handle = match transport.account_subscribe(pubkey, on_change).await {
            Ok(handle) => handle,
            Err(err) => {
                self.inner.subscribe_failures.increment();
                warn!("subscribe for {} failed: {:?}", pubkey, err);
                let step = {
                    let mut state = self.lock();
                    self.step(&mut state, Trigger::TransportFailed)
                };
                self.perform(step, Some(DisconnectReason::Transport(err.to_string())));
                return None;
            }
        };

        enum Registered {
            New(StepResult),
            Existing(SubscriptionHandle),
            Rejected,
        }
        let registered = {
            let mut state = self.lock();
            let current = state
                .registry
                .get(&pubkey)
                .map(|entry| (entry.id, entry.handle));
            if state.phase == Phase::Shutdown {
                Registered::Rejected
            } else {
                match current {
                    Some((id, _)) if Some(id) == restoring_id => {
                        if let Some(entry) = state.registry.get_mut(&pubkey) {
                            entry.handle = handle;
                            entry.stale = false;
                        }
                        Registered::New(self.step(&mut state, Trigger::SubscribeSucceeded))
                    }
                    Some((_, existing)) => Registered::Existing(existing),
                    None => {
                        state.next_entry_id += 1;
                        let id = state.next_entry_id;
                        state.registry.insert(
                            pubkey,
                            Entry {
                                id,
                                handle,
                                callback,
                                stale: false,
                            },
                        );
                        Registered::New(self.step(&mut state, Trigger::SubscribeSucceeded))
                    }
                }
            }
        };

        match registered {
            Registered::New(step) => {
                info!("subscribed to {} as {}", pubkey, handle);
                self.perform(step, None);
                self.emit(WatchEvent::Subscribed { pubkey, handle });
                if let Some(old) = old_handle {
                    if let Err(err) = transport.account_unsubscribe(old).await {
                        debug!("dropping stale {} for {}: {:?}", old, pubkey, err);
                    }
                }
                Some(handle)
            }
            Registered::Existing(existing) => {
                // a concurrent subscribe for the same account won
                if let Err(err) = transport.account_unsubscribe(handle).await {
                    debug!("cancelling duplicate {} for {}: {:?}", handle, pubkey, err);
                }
                Some(existing)
            }
            Registered::Rejected => {
                if let Err(err) = transport.account_unsubscribe(handle).await {
                    debug!("cancelling {} for {} after shutdown: {:?}", handle, pubkey, err);
                }
                None
            }
        }
    }

    /// Subscribes each account in turn, returning the handles in input order.
    pub async fn subscribe_many(
        &self,
        accounts: impl IntoIterator<Item = (Pubkey, UpdateCallback)>,
    ) -> Vec<(Pubkey, Option<SubscriptionHandle>)> {
        let mut handles = Vec::new();
        for (pubkey, callback) in accounts {
            let handle = self.subscribe(pubkey, callback).await;
            handles.push((pubkey, handle));
        }
        handles
    }

    /// Stops watching `pubkey`.
    ///
    /// The registry entry is always removed. Returns `false` when there was no
    /// entry or the transport failed to cancel the live subscription.
    pub async fn unsubscribe(&self, pubkey: &Pubkey) -> bool {
        let entry = self.lock().registry.remove(pubkey);
        let Some(entry) = entry else {
            debug!("unsubscribe for unknown account {}", pubkey);
            return false;
        };

        match self.inner.transport.account_unsubscribe(entry.handle).await {
            Ok(()) => {
                info!("unsubscribed from {}", pubkey);
                self.emit(WatchEvent::Unsubscribed { pubkey: *pubkey });
                true
            }
            Err(err) => {
                warn!("unsubscribe for {} failed: {:?}", pubkey, err);
                false
            }
        }
    }

    /// Reported by the transport adapter when its connection dropped.
    pub fn notify_disconnected(&self, reason: &str) {
        let step = {
            let mut state = self.lock();
            self.step(&mut state, Trigger::TransportFailed)
        };
        self.perform(step, Some(DisconnectReason::Transport(reason.to_string())));
    }

    /// Cancels every subscription and stops all reconnection activity.
    ///
    /// Safe to call more than once and while a resubscribe pass is pending.
    pub async fn shutdown(&self) {
        let entries: Vec<(Pubkey, Entry)> = {
            let mut state = self.lock();
            if state.phase == Phase::Shutdown {
                return;
            }
            self.step(&mut state, Trigger::Shutdown);
            state.pass_pending = false;
            state.pass_rerun = false;
            self.inner.dispatcher.stop();
            state.registry.drain().collect()
        };
        // Don't care if no pass is waiting on this.
        let _ = self.inner.exit_sender.send(());

        info!("shutting down, cancelling {} subscriptions", entries.len());
        let transport = &self.inner.transport;
        let results = join_all(
            entries
                .iter()
                .map(|(_, entry)| transport.account_unsubscribe(entry.handle)),
        )
        .await;
        for ((pubkey, entry), result) in entries.iter().zip(results) {
            if let Err(err) = result {
                warn!("cancelling {} for {} failed: {:?}", entry.handle, pubkey, err);
            }
        }
        self.emit(WatchEvent::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().phase.connection_state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().phase.attempts()
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().phase == Phase::Shutdown
    }

    /// Number of registered accounts, stale ones included.
    pub fn subscription_count(&self) -> usize {
        self.lock().registry.len()
    }

    /// Every registered account, stale ones included.
    pub fn subscribed_accounts(&self) -> HashSet<Pubkey> {
        self.lock().registry.keys().copied().collect()
    }

    /// Registered accounts whose transport subscription is down.
    ///
    /// After the watcher gives up, the accounts it could not restore stay
    /// registered here until the next successful `subscribe` renews them.
    pub fn stale_accounts(&self) -> HashSet<Pubkey> {
        self.lock()
            .registry
            .iter()
            .filter(|(_, entry)| entry.stale)
            .map(|(pubkey, _)| *pubkey)
            .collect()
    }

    pub fn events(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.events.subscribe()
    }
}
