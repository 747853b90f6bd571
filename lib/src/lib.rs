pub mod metrics;
pub mod selector;

use std::{
    fmt,
    fs::File,
    io::Read,
    path::Path,
    time::{Duration, SystemTime},
};

use anyhow::Context;
use serde_derive::Deserialize;
use solana_sdk::clock::Slot;
use solana_sdk::pubkey::Pubkey;

pub use selector::{PoolKind, TokenAllocation, TokenConfig, TokenSelector};

trait AnyhowWrap {
    type Value;
    fn map_err_anyhow(self) -> anyhow::Result<Self::Value>;
}

impl<T, E: std::fmt::Debug> AnyhowWrap for Result<T, E> {
    type Value = T;
    fn map_err_anyhow(self) -> anyhow::Result<Self::Value> {
        self.map_err(|err| anyhow::anyhow!("{:?}", err))
    }
}

/// Balance observation for a monitored account.
#[derive(Clone, PartialEq, Debug)]
pub struct AccountUpdate {
    pub pubkey: Pubkey,
    pub lamports: u64,
    /// Slot the transport observed the change at
    pub slot: Slot,
    /// Local wall-clock time of receipt
    pub received_at: SystemTime,
}

impl AccountUpdate {
    pub fn new(pubkey: Pubkey, lamports: u64, slot: Slot) -> AccountUpdate {
        AccountUpdate {
            pubkey,
            lamports,
            slot,
            received_at: SystemTime::now(),
        }
    }

    /// Whether this update supersedes one observed at `slot`.
    pub fn is_newer_than(&self, slot: Slot) -> bool {
        self.slot > slot
    }
}

/// Opaque subscription id issued by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Health of the transport as seen by the watch service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_base_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_event_buffer_size() -> usize {
    256
}

#[derive(Clone, Debug, Deserialize)]
pub struct WatchConfig {
    /// Resubscribe passes attempted before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Delay before the first resubscribe pass, doubled on every failure
    #[serde(default = "default_base_reconnect_delay_ms")]
    pub base_reconnect_delay_ms: u64,
    /// Upper bound for the resubscribe delay
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    /// Log every account update at info level
    #[serde(default)]
    pub verbose: bool,
    /// Capacity of the watch event broadcast channel
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_reconnect_delay_ms: default_base_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            verbose: false,
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

impl WatchConfig {
    pub fn base_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.base_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_reconnect_delay_ms == 0 {
            anyhow::bail!("base_reconnect_delay_ms must be positive");
        }
        if self.max_reconnect_delay_ms < self.base_reconnect_delay_ms {
            anyhow::bail!(
                "max_reconnect_delay_ms ({}) is below base_reconnect_delay_ms ({})",
                self.max_reconnect_delay_ms,
                self.base_reconnect_delay_ms
            );
        }
        if self.event_buffer_size == 0 {
            anyhow::bail!("event_buffer_size must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TokenEntry {
    pub symbol: String,
    pub mint: String,
    /// Account whose balance accrues the token's fees
    pub vault: String,
    pub pool: String,
    #[serde(default)]
    pub pool_kind: PoolKind,
    #[serde(default)]
    pub is_root: bool,
}

impl TokenEntry {
    pub fn to_token_config(&self) -> anyhow::Result<TokenConfig> {
        Ok(TokenConfig {
            symbol: self.symbol.clone(),
            mint: parse_pubkey(&self.symbol, "mint", &self.mint)?,
            vault: parse_pubkey(&self.symbol, "vault", &self.vault)?,
            pool: parse_pubkey(&self.symbol, "pool", &self.pool)?,
            pool_kind: self.pool_kind,
            is_root: self.is_root,
        })
    }
}

// Decoded by hand rather than with `Pubkey::from_str` so bad base58 and a wrong
// length get separate messages naming the token and field.
fn parse_pubkey(symbol: &str, field: &str, value: &str) -> anyhow::Result<Pubkey> {
    let bytes = bs58::decode(value)
        .into_vec()
        .with_context(|| format!("token {}: {} is not base58: {:?}", symbol, field, value))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err_anyhow()
        .with_context(|| format!("token {}: {} is not 32 bytes", symbol, field))?;
    Ok(Pubkey::new_from_array(array))
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
    /// Seconds between metrics log lines (0 to disable)
    #[serde(default)]
    pub metrics_interval_secs: u64,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let mut file =
            File::open(path).with_context(|| format!("opening config file {:?}", path))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_json(&contents).with_context(|| format!("loading config file {:?}", path))
    }

    pub fn from_json(contents: &str) -> anyhow::Result<Config> {
        let config: Config = serde_json::from_str(contents)
            .context("the config file is not in the JSON format expected")?;
        config.watch.validate()?;
        let roots = config.tokens.iter().filter(|t| t.is_root).count();
        if roots > 1 {
            anyhow::bail!("{} tokens are flagged is_root, expected at most one", roots);
        }
        Ok(config)
    }

    pub fn token_configs(&self) -> anyhow::Result<Vec<TokenConfig>> {
        self.tokens.iter().map(TokenEntry::to_token_config).collect()
    }
}
