use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use solana_sdk::{clock::Slot, pubkey::Pubkey};
use solana_vault_connector_lib::SubscriptionHandle;

use crate::{transport::AccountTransport, types::BalanceCallback};

#[derive(Default)]
struct MockState {
    next_handle: u64,
    live: BTreeMap<SubscriptionHandle, (Pubkey, BalanceCallback)>,
    fail_subscribe: bool,
    fail_unsubscribe: bool,
    subscribe_calls: usize,
    subscribe_delay: Duration,
}

/// In-memory transport for tests, scriptable to fail.
#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_failing(&self, failing: bool) {
        self.lock().fail_subscribe = failing;
    }

    pub fn set_unsubscribe_failing(&self, failing: bool) {
        self.lock().fail_unsubscribe = failing;
    }

    /// Every subscribe takes this long before it answers.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.lock().subscribe_delay = delay;
    }

    pub fn subscribe_calls(&self) -> usize {
        self.lock().subscribe_calls
    }

    pub fn live_count(&self, pubkey: &Pubkey) -> usize {
        self.lock().live.values().filter(|(p, _)| p == pubkey).count()
    }

    pub fn live_total(&self) -> usize {
        self.lock().live.len()
    }

    /// Delivers a balance change to every live subscription of `pubkey`.
    pub fn emit(&self, pubkey: &Pubkey, lamports: u64, slot: Slot) {
        let callbacks: Vec<BalanceCallback> = self
            .lock()
            .live
            .values()
            .filter(|(p, _)| p == pubkey)
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(lamports, slot);
        }
    }
}

#[async_trait]
impl AccountTransport for MockTransport {
    async fn account_subscribe(
        &self,
        pubkey: Pubkey,
        on_change: BalanceCallback,
    ) -> anyhow::Result<SubscriptionHandle> {
        let delay = self.lock().subscribe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.subscribe_calls += 1;
        if state.fail_subscribe {
            anyhow::bail!("connection refused");
        }
        state.next_handle += 1;
        let handle = SubscriptionHandle(state.next_handle);
        state.live.insert(handle, (pubkey, on_change));
        Ok(handle)
    }

    async fn account_unsubscribe(&self, handle: SubscriptionHandle) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.fail_unsubscribe {
            anyhow::bail!("connection reset");
        }
        match state.live.remove(&handle) {
            Some(_) => Ok(()),
            None => anyhow::bail!("unknown subscription {}", handle),
        }
    }
}
