use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use valve_common::{CommandPublisher, ControlEngine, ValveStore};

/// `tokio::time::interval` panics on a zero period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Periodically demotes valves that stopped reporting to `Offline`.
pub struct OfflineMonitor<S, P> {
    engine: Arc<ControlEngine<S, P>>,
    period: Duration,
}

impl<S, P> OfflineMonitor<S, P>
where
    S: ValveStore + 'static,
    P: CommandPublisher + 'static,
{
    pub fn new(engine: Arc<ControlEngine<S, P>>) -> Self {
        let period = engine.config().sweep_interval().max(MIN_SWEEP_INTERVAL);
        Self { engine, period }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(period_ms = self.period.as_millis() as u64, "offline monitor started");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("offline monitor stopped");
    }

    async fn sweep(&self) {
        let engine = Arc::clone(&self.engine);
        match tokio::task::spawn_blocking(move || engine.sweep_offline(Utc::now())).await {
            Ok(offline) if offline.is_empty() => debug!("offline sweep found no stale valves"),
            Ok(offline) => info!(count = offline.len(), valves = ?offline, "offline sweep"),
            Err(err) => warn!("offline sweep task failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use valve_common::{EngineConfig, MemoryStore, RecordingPublisher, ValveState};

    use super::*;

    fn engine(offline_timeout_ms: u64) -> Arc<ControlEngine<MemoryStore, RecordingPublisher>> {
        engine_with_sweep(offline_timeout_ms, 20)
    }

    fn engine_with_sweep(
        offline_timeout_ms: u64,
        sweep_interval_ms: u64,
    ) -> Arc<ControlEngine<MemoryStore, RecordingPublisher>> {
        Arc::new(ControlEngine::new(
            EngineConfig {
                offline_timeout_ms,
                sweep_interval_ms,
                ..EngineConfig::default()
            },
            MemoryStore::new(),
            RecordingPublisher::new(),
        ))
    }

    #[tokio::test]
    async fn silent_valve_goes_offline_and_monitor_stops() {
        let engine = engine(50);
        engine.handle_temperature("v1", 18.0, Utc::now());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = tokio::spawn(OfflineMonitor::new(Arc::clone(&engine)).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.valve("v1").unwrap().state, ValveState::Offline);
        assert_eq!(
            engine.store().get_valve("v1").unwrap().unwrap().state,
            ValveState::Offline
        );

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), monitor)
            .await
            .expect("monitor stops on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn reporting_valve_stays_online() {
        let engine = engine(60_000);
        engine.handle_temperature("v1", 18.0, Utc::now());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = tokio::spawn(OfflineMonitor::new(Arc::clone(&engine)).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.valve("v1").unwrap().state, ValveState::Heating);

        drop(shutdown_tx);
        monitor.await.unwrap();
    }

    #[tokio::test]
    async fn zero_sweep_interval_is_clamped() {
        let engine = engine_with_sweep(50, 0);
        engine.handle_temperature("v1", 18.0, Utc::now());

        let monitor = OfflineMonitor::new(Arc::clone(&engine));
        assert_eq!(monitor.period, MIN_SWEEP_INTERVAL);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.valve("v1").unwrap().state, ValveState::Offline);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
