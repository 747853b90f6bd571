use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use solana_vault_connector_lib::SubscriptionHandle;

use crate::types::BalanceCallback;

/// Balance-change subscriptions offered by a ledger connection.
///
/// The watcher never opens or closes the connection itself; an adapter that
/// notices a dropped connection reports it through
/// [`AccountWatcher::notify_disconnected`](crate::account_watcher::AccountWatcher::notify_disconnected).
#[async_trait]
pub trait AccountTransport: Send + Sync {
    async fn account_subscribe(
        &self,
        pubkey: Pubkey,
        on_change: BalanceCallback,
    ) -> anyhow::Result<SubscriptionHandle>;

    async fn account_unsubscribe(&self, handle: SubscriptionHandle) -> anyhow::Result<()>;
}
