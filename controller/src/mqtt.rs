use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use valve_common::{
    accept_message, CommandPublisher, NetworkConfig, PublishError, TOPIC_FILTER_SETPOINT,
    TOPIC_FILTER_TEMPERATURE,
};

use crate::dispatch::Dispatcher;

const INBOUND_TOPICS: [&str; 2] = [TOPIC_FILTER_TEMPERATURE, TOPIC_FILTER_SETPOINT];

/// Publishes commands through the client's request queue without blocking.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl CommandPublisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(|err| PublishError::Transport(err.to_string()))
    }
}

pub fn mqtt_options(network: &NetworkConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        network.client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(network.keep_alive_secs));
    if !network.mqtt_user.is_empty() {
        options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    options
}

/// Reads the broker connection until shutdown. Subscriptions are renewed on
/// every ConnAck so a reconnect does not silently stop telemetry.
pub fn spawn_mqtt_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        if let Some(inbound) = accept_message(&message.topic, &message.payload) {
                            dispatcher.dispatch(inbound);
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected");
                        subscribe_topics(&client);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("mqtt poll error: {err}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(err) = client.try_disconnect() {
            debug!("mqtt disconnect request failed: {err}");
        } else {
            let _ = tokio::time::timeout(Duration::from_secs(1), eventloop.poll()).await;
        }
        info!("mqtt loop stopped");
    })
}

fn subscribe_topics(client: &AsyncClient) {
    for topic in INBOUND_TOPICS {
        if let Err(err) = client.try_subscribe(topic, QoS::AtMostOnce) {
            warn!(topic, "mqtt subscribe failed: {err}");
        }
    }
}
