use std::sync::Arc;

use anyhow::Context;
use rumqttc::AsyncClient;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use valve_common::{ControlEngine, MessageRouter, NetworkConfig, RuntimeConfig, ValveStore};

use crate::{
    dispatch::Dispatcher,
    monitor::OfflineMonitor,
    mqtt::{self, MqttPublisher},
    store::SqliteStore,
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = SqliteStore::data_dir_from_env();
    let store = SqliteStore::open(&data_dir)
        .with_context(|| format!("failed to open valve store at {}", data_dir.display()))?;

    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime.network);
    runtime.sanitize();

    let (client, eventloop) = AsyncClient::new(mqtt::mqtt_options(&runtime.network), 64);

    log_known_records(&store);
    info!(
        data_dir = %store.dir().display(),
        mqtt_host = %runtime.network.mqtt_host,
        mqtt_port = runtime.network.mqtt_port,
        offline_timeout_ms = runtime.engine.offline_timeout_ms,
        "valve controller starting"
    );

    let engine = Arc::new(ControlEngine::new(
        runtime.engine.clone(),
        store,
        MqttPublisher::new(client.clone()),
    ));
    let router = MessageRouter::new(Arc::clone(&engine));
    let (dispatcher, shards) = Dispatcher::spawn(router, &runtime.dispatch);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = tokio::spawn(OfflineMonitor::new(Arc::clone(&engine)).run(shutdown_rx.clone()));
    let mqtt_loop = mqtt::spawn_mqtt_loop(client, eventloop, dispatcher, shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    // Ignored error means every receiver already exited.
    let _ = shutdown_tx.send(true);
    join("mqtt loop", mqtt_loop).await;
    // The dispatcher is dropped with the mqtt loop, so shards drain and exit.
    for shard in shards {
        join("dispatch shard", shard).await;
    }
    join("offline monitor", monitor).await;

    info!("valve controller stopped");
    Ok(())
}

fn log_known_records(store: &SqliteStore) {
    match (store.list_valves(), store.list_rooms()) {
        (Ok(valves), Ok(rooms)) => {
            let assigned = valves.iter().filter(|valve| valve.room_id.is_some()).count();
            info!(
                valves = valves.len(),
                assigned,
                rooms = rooms.len(),
                "loaded persisted records"
            );
        }
        (Err(err), _) | (_, Err(err)) => warn!("failed to list persisted records: {err}"),
    }
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

async fn join(name: &str, handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        warn!("{name} task ended abnormally: {err}");
    }
}
