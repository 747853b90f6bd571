use std::{fmt, sync::Arc, time::Duration};

use solana_sdk::{clock::Slot, pubkey::Pubkey};
use solana_vault_connector_lib::{AccountUpdate, SubscriptionHandle};

/// Consumer of account updates.
///
/// Errors and panics are logged by the watcher and never reach other accounts.
pub type UpdateCallback = Arc<dyn Fn(AccountUpdate) -> anyhow::Result<()> + Send + Sync>;

/// Invoked by the transport with (lamports, slot) on every balance change.
pub type BalanceCallback = Arc<dyn Fn(u64, Slot) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    Transport(String),
    MaxAttempts,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Transport(msg) => write!(f, "transport: {}", msg),
            DisconnectReason::MaxAttempts => write!(f, "max_attempts"),
        }
    }
}

/// Advisory notifications emitted by the account watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Connected,
    Disconnected {
        reason: DisconnectReason,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Resubscribed {
        succeeded: usize,
        failed: usize,
    },
    Subscribed {
        pubkey: Pubkey,
        handle: SubscriptionHandle,
    },
    Unsubscribed {
        pubkey: Pubkey,
    },
    Shutdown,
}
