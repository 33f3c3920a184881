use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{info, warn};

use valve_common::{
    announce_topic, temperature_topic, AnnouncePayload, CommandPayload, TemperaturePayload,
    TOPIC_FILTER_COMMAND,
};

use crate::thermal::SimulatedValve;

type Valves = Arc<Mutex<HashMap<String, SimulatedValve>>>;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut valve_ids: Vec<String> = std::env::args().skip(1).collect();
    if valve_ids.is_empty() {
        valve_ids.push("valve1".to_string());
    }

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("valve-simulator", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    let valves: Valves = {
        let mut rng = rand::thread_rng();
        Arc::new(Mutex::new(
            valve_ids
                .iter()
                .map(|id| (id.clone(), SimulatedValve::new(&mut rng)))
                .collect(),
        ))
    };

    let command_valves = Arc::clone(&valves);
    let command_client = mqtt.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_command(&command_valves, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("simulator mqtt connected");
                    if let Err(err) =
                        command_client.try_subscribe(TOPIC_FILTER_COMMAND, QoS::AtMostOnce)
                    {
                        warn!("command subscribe failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("simulator mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    for valve_id in &valve_ids {
        let announce = AnnouncePayload {
            id: valve_id.clone(),
            ts: epoch_seconds(),
            proto: "sim".to_string(),
        };
        mqtt.publish(
            announce_topic(valve_id),
            QoS::AtLeastOnce,
            true,
            serde_json::to_vec(&announce)?,
        )
        .await
        .context("failed to publish valve announcement")?;
    }

    info!(valves = ?valve_ids, "valve simulator started");

    loop {
        for valve_id in &valve_ids {
            let temperature = {
                let mut valves = valves.lock().await;
                let Some(valve) = valves.get_mut(valve_id) else {
                    continue;
                };
                let temperature = valve.step(&mut rand::thread_rng());
                info!(valve_id = %valve_id, temperature, heating = valve.heating, "published temperature");
                temperature
            };

            let payload = serde_json::to_vec(&TemperaturePayload { value: temperature })?;
            mqtt.publish(temperature_topic(valve_id), QoS::AtMostOnce, false, payload)
                .await
                .context("failed to publish valve temperature")?;

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn handle_command(valves: &Valves, topic: &str, payload: &[u8]) {
    let parts: Vec<&str> = topic.split('/').collect();
    let [_, _, valve_id, "command"] = parts.as_slice() else {
        info!(topic, "ignoring message on unexpected topic");
        return;
    };

    let heating = serde_json::from_slice::<CommandPayload>(payload)
        .map(|command| command.heating)
        .unwrap_or(false);

    let mut valves = valves.lock().await;
    match valves.get_mut(*valve_id) {
        Some(valve) => {
            valve.heating = heating;
            info!(valve_id = %valve_id, heating, "command received");
        }
        None => info!(valve_id = %valve_id, "command for unknown valve"),
    }
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1_000.0
}
