//! Connection state machine of the account watcher.
//!
//! `transition` is a pure function so the exhausted and shutdown cases can be
//! checked without a transport or a clock. The watcher owns the timers and
//! feeds the outcomes back in as triggers.

use std::time::Duration;

use solana_vault_connector_lib::{ConnectionState, WatchConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    /// First subscribe in flight. `recovering` is set when coming out of `Exhausted`.
    Connecting {
        recovering: bool,
    },
    Connected,
    Reconnecting {
        attempt: u32,
    },
    /// Gave up after the configured number of attempts.
    Exhausted {
        attempts: u32,
    },
    Shutdown,
}

impl Phase {
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            Phase::Disconnected | Phase::Exhausted { .. } | Phase::Shutdown => {
                ConnectionState::Disconnected
            }
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Connected => ConnectionState::Connected,
            Phase::Reconnecting { .. } => ConnectionState::Reconnecting,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Phase::Reconnecting { attempt } => *attempt,
            Phase::Exhausted { attempts } => *attempts,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    SubscribeStarted,
    SubscribeSucceeded,
    /// A transport call failed or the adapter reported a dropped connection.
    TransportFailed,
    ResubscribeCompleted { failed: usize },
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Nothing,
    Connected,
    /// Connected again after exhaustion; the older registrations need a pass.
    Recovered,
    ScheduleResubscribe { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &WatchConfig) -> Self {
        ReconnectPolicy {
            base_delay: config.base_reconnect_delay(),
            max_delay: config.max_reconnect_delay(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// `min(base * 2^(attempt - 1), max)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn next_attempt(&self, previous: u32) -> (Phase, Action) {
        if previous >= self.max_attempts {
            return (Phase::Exhausted { attempts: previous }, Action::GiveUp);
        }
        let attempt = previous + 1;
        (
            Phase::Reconnecting { attempt },
            Action::ScheduleResubscribe {
                attempt,
                delay: self.delay(attempt),
            },
        )
    }
}

pub fn transition(phase: Phase, trigger: Trigger, policy: &ReconnectPolicy) -> (Phase, Action) {
    match (phase, trigger) {
        (Phase::Shutdown, _) | (_, Trigger::Shutdown) => (Phase::Shutdown, Action::Nothing),

        (Phase::Disconnected, Trigger::SubscribeStarted) => {
            (Phase::Connecting { recovering: false }, Action::Nothing)
        }
        (Phase::Exhausted { .. }, Trigger::SubscribeStarted) => {
            (Phase::Connecting { recovering: true }, Action::Nothing)
        }
        (Phase::Connecting { recovering }, Trigger::SubscribeSucceeded) => {
            let action = if recovering {
                Action::Recovered
            } else {
                Action::Connected
            };
            (Phase::Connected, action)
        }

        (Phase::Connecting { .. } | Phase::Connected, Trigger::TransportFailed) => {
            policy.next_attempt(0)
        }

        (Phase::Reconnecting { .. }, Trigger::ResubscribeCompleted { failed: 0 }) => {
            (Phase::Connected, Action::Connected)
        }
        (Phase::Reconnecting { attempt }, Trigger::ResubscribeCompleted { .. }) => {
            policy.next_attempt(attempt)
        }
        // recovery pass after exhaustion left some accounts behind
        (Phase::Connected, Trigger::ResubscribeCompleted { failed }) if failed > 0 => {
            policy.next_attempt(0)
        }

        (phase, _) => (phase, Action::Nothing),
    }
}
