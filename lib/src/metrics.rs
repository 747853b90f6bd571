use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use log::*;
use tokio::{sync::broadcast, task::JoinHandle};

#[derive(Clone, Debug, Default)]
pub struct MetricU64 {
    value: Arc<AtomicU64>,
}

impl MetricU64 {
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::AcqRel);
    }
}

/// Named counters shared between components.
///
/// Registering an existing name returns the counter already stored under it.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    registry: Arc<RwLock<BTreeMap<String, MetricU64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_u64(&self, name: &str) -> MetricU64 {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        registry.entry(name.to_string()).or_default().clone()
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.get(name).map(MetricU64::value)
    }

    /// Current values, ordered by name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .iter()
            .map(|(name, metric)| (name.clone(), metric.value()))
            .collect()
    }

    /// Logs every counter each `interval` until `exit` fires.
    pub fn spawn_reporter(
        &self,
        interval: Duration,
        mut exit: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = exit.recv() => { break; },
                    _ = tokio::time::sleep(interval) => {},
                }
                let line = metrics
                    .snapshot()
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!("metrics {}", line);
            }
            debug!("metrics reporter stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_shares_counter() {
        let metrics = Metrics::new();
        let a = metrics.register_u64("account_updates");
        let b = metrics.register_u64("account_updates");
        a.increment();
        b.add(2);
        assert_eq!(a.value(), 3);
        assert_eq!(metrics.get_u64("account_updates"), Some(3));
        assert_eq!(metrics.get_u64("missing"), None);
    }

    #[test]
    fn test_snapshot_sorted() {
        let metrics = Metrics::new();
        metrics.register_u64("b").set(2);
        metrics.register_u64("a").set(1);
        assert_eq!(
            metrics.snapshot(),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_stops_on_exit() {
        let metrics = Metrics::new();
        metrics.register_u64("reconnect_attempts").increment();
        let (exit_sender, exit_receiver) = broadcast::channel(1);
        let reporter = metrics.spawn_reporter(Duration::from_secs(5), exit_receiver);

        tokio::time::sleep(Duration::from_secs(12)).await;
        exit_sender.send(()).unwrap();
        reporter.await.unwrap();
    }
}
