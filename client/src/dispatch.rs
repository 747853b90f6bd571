use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::*;
use solana_sdk::{clock::Slot, pubkey::Pubkey};
use solana_vault_connector_lib::{metrics::MetricU64, AccountUpdate};

use crate::types::{BalanceCallback, UpdateCallback};

/// Turns raw transport notifications into `AccountUpdate`s for one callback.
///
/// A failing or panicking callback is logged and counted here, so it cannot
/// disturb delivery for any other account.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    verbose: bool,
    stopped: Arc<AtomicBool>,
    updates: MetricU64,
    callback_failures: MetricU64,
}

impl Dispatcher {
    pub fn new(verbose: bool, updates: MetricU64, callback_failures: MetricU64) -> Self {
        Dispatcher {
            verbose,
            stopped: Arc::new(AtomicBool::new(false)),
            updates,
            callback_failures,
        }
    }

    /// Drop everything delivered from now on.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn balance_callback(&self, pubkey: Pubkey, callback: UpdateCallback) -> BalanceCallback {
        let dispatcher = self.clone();
        Arc::new(move |lamports: u64, slot: Slot| {
            dispatcher.deliver(AccountUpdate::new(pubkey, lamports, slot), &callback)
        })
    }

    pub fn deliver(&self, update: AccountUpdate, callback: &UpdateCallback) {
        if self.stopped.load(Ordering::Acquire) {
            trace!("dropping update for {} after shutdown", update.pubkey);
            return;
        }
        self.updates.increment();
        if self.verbose {
            info!(
                "account {} lamports {} at slot {}",
                update.pubkey, update.lamports, update.slot
            );
        } else {
            trace!(
                "account {} lamports {} at slot {}",
                update.pubkey,
                update.lamports,
                update.slot
            );
        }

        let pubkey = update.pubkey;
        let slot = update.slot;
        match panic::catch_unwind(AssertUnwindSafe(|| callback(update))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.callback_failures.increment();
                warn!(
                    "update callback for {} at slot {} failed: {:?}",
                    pubkey, slot, err
                );
            }
            Err(payload) => {
                self.callback_failures.increment();
                error!(
                    "update callback for {} at slot {} panicked: {}",
                    pubkey,
                    slot,
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
