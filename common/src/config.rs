use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_setpoint: f64,
    pub default_hysteresis: f64,
    pub offline_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_setpoint: 22.0,
            default_hysteresis: 0.5,
            offline_timeout_ms: 10_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn offline_timeout(&self) -> Duration {
        Duration::from_millis(self.offline_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn sanitize(&mut self) {
        if !self.default_setpoint.is_finite() {
            self.default_setpoint = 22.0;
        }
        if !self.default_hysteresis.is_finite() || self.default_hysteresis < 0.0 {
            self.default_hysteresis = 0.5;
        }
        self.offline_timeout_ms = self.offline_timeout_ms.max(1_000);
        self.sweep_interval_ms = self.sweep_interval_ms.clamp(100, self.offline_timeout_ms);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            client_id: "valve-controller".to_string(),
            keep_alive_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub shards: usize,
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.engine.sanitize();
        self.network.keep_alive_secs = self.network.keep_alive_secs.clamp(5, 3_600);
        if self.network.client_id.trim().is_empty() {
            self.network.client_id = NetworkConfig::default().client_id;
        }
        self.dispatch.shards = self.dispatch.shards.clamp(1, 64);
        self.dispatch.queue_capacity = self.dispatch.queue_capacity.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"network":{"mqtt_host":"broker.lan"}}"#).unwrap();
        assert_eq!(runtime.network.mqtt_host, "broker.lan");
        assert_eq!(runtime.network.mqtt_port, 1883);
        assert_eq!(runtime.engine.offline_timeout_ms, 10_000);
        assert_eq!(runtime.engine.sweep_interval_ms, 5_000);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut runtime = RuntimeConfig::default();
        runtime.engine.default_hysteresis = -1.0;
        runtime.engine.offline_timeout_ms = 0;
        runtime.engine.sweep_interval_ms = 60_000;
        runtime.dispatch.shards = 0;
        runtime.network.client_id = "  ".to_string();

        runtime.sanitize();

        assert_eq!(runtime.engine.default_hysteresis, 0.5);
        assert_eq!(runtime.engine.offline_timeout_ms, 1_000);
        assert_eq!(runtime.engine.sweep_interval_ms, 1_000);
        assert_eq!(runtime.dispatch.shards, 1);
        assert_eq!(runtime.network.client_id, "valve-controller");
    }
}
