//! Picks the secondary token that runs the next fee cycle.
//!
//! Selection is a pure function of an allocation snapshot and a tick, normally
//! the current slot. Every observer holding the same snapshot and slot picks
//! the same token, so no coordination between keepers is needed.
//!
//! The result is only reproducible while the snapshot keeps its order: callers
//! must build the allocation list from an ordered source (config order, sorted
//! keys) and not from a hash map iteration.

use serde_derive::Deserialize;
use solana_sdk::{clock::Slot, pubkey::Pubkey};

/// Minimum pending fees, in lamports, for a secondary token to enter a cycle.
pub const MIN_PENDING_FEES_LAMPORTS: u64 = 5_500_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    #[default]
    BondingCurve,
    AmmPool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenConfig {
    pub symbol: String,
    pub mint: Pubkey,
    pub vault: Pubkey,
    pub pool: Pubkey,
    pub pool_kind: PoolKind,
    pub is_root: bool,
}

/// A token together with the fees accrued for it since its last cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenAllocation {
    pub token: TokenConfig,
    pub pending_fees: u64,
}

impl TokenAllocation {
    pub fn new(token: TokenConfig, pending_fees: u64) -> Self {
        TokenAllocation {
            token,
            pending_fees,
        }
    }

    pub fn is_root(&self) -> bool {
        self.token.is_root
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenSelector {
    min_pending_fees: u64,
}

impl Default for TokenSelector {
    fn default() -> Self {
        Self::with_threshold(MIN_PENDING_FEES_LAMPORTS)
    }
}

impl TokenSelector {
    pub fn with_threshold(min_pending_fees: u64) -> Self {
        TokenSelector { min_pending_fees }
    }

    pub fn min_pending_fees(&self) -> u64 {
        self.min_pending_fees
    }

    /// Secondary tokens whose pending fees reach the threshold, in input order.
    pub fn eligible_tokens<'a>(
        &self,
        allocations: &'a [TokenAllocation],
    ) -> Vec<&'a TokenAllocation> {
        allocations
            .iter()
            .filter(|a| !a.is_root() && a.pending_fees >= self.min_pending_fees)
            .collect()
    }

    /// Eligibility filter followed by `select_for_cycle`.
    pub fn select<'a>(
        &self,
        allocations: &'a [TokenAllocation],
        tick: Slot,
    ) -> Option<&'a TokenAllocation> {
        select_for_cycle(&self.eligible_tokens(allocations), tick).copied()
    }
}

/// Returns `eligible[tick % eligible.len()]`, or `None` for an empty list.
pub fn select_for_cycle<T>(eligible: &[T], tick: Slot) -> Option<&T> {
    if eligible.is_empty() {
        return None;
    }
    let index = tick % eligible.len() as u64;
    eligible.get(index as usize)
}

/// All non-root tokens, in input order, regardless of pending fees.
pub fn secondaries(allocations: &[TokenAllocation]) -> Vec<&TokenAllocation> {
    allocations.iter().filter(|a| !a.is_root()).collect()
}

/// First root-flagged token, if any.
pub fn root(allocations: &[TokenAllocation]) -> Option<&TokenAllocation> {
    allocations.iter().find(|a| a.is_root())
}
