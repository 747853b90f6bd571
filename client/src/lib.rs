pub mod account_watcher;
mod dispatch;
pub mod reconnect;
pub mod transport;
pub mod types;

#[cfg(test)]
mod mock_transport;

pub use account_watcher::AccountWatcher;
pub use transport::AccountTransport;
pub use types::{BalanceCallback, DisconnectReason, UpdateCallback, WatchEvent};

pub use solana_vault_connector_lib::{
    AccountUpdate, ConnectionState, SubscriptionHandle, WatchConfig,
};
