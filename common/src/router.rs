use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    engine::ControlEngine,
    error::RouteError,
    publisher::CommandPublisher,
    store::ValveStore,
    topics::InboundTopic,
    types::{SetpointPayload, TemperaturePayload},
};

pub const MAX_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Temperature { valve_id: String, value: f64 },
    Setpoint { valve_id: String, setpoint: f64 },
}

impl InboundMessage {
    pub fn valve_id(&self) -> &str {
        match self {
            Self::Temperature { valve_id, .. } | Self::Setpoint { valve_id, .. } => valve_id,
        }
    }
}

/// `Ok(None)` means the topic is not ours and the message is ignored silently.
pub fn parse_message(topic: &str, payload: &[u8]) -> Result<Option<InboundMessage>, RouteError> {
    match InboundTopic::parse(topic) {
        InboundTopic::Unrelated => Ok(None),
        InboundTopic::Malformed => Err(RouteError::MalformedTopic(topic.to_string())),
        InboundTopic::Temperature(valve_id) => {
            let body: TemperaturePayload = decode(payload, "value")?;
            let value = finite(body.value, "value")?;
            Ok(Some(InboundMessage::Temperature {
                valve_id: valve_id.to_string(),
                value,
            }))
        }
        InboundTopic::Setpoint(valve_id) => {
            let body: SetpointPayload = decode(payload, "setpoint")?;
            let setpoint = finite(body.setpoint, "setpoint")?;
            Ok(Some(InboundMessage::Setpoint {
                valve_id: valve_id.to_string(),
                setpoint,
            }))
        }
    }
}

/// [`parse_message`] for transport loops: anything that does not parse is
/// logged here and dropped.
pub fn accept_message(topic: &str, payload: &[u8]) -> Option<InboundMessage> {
    match parse_message(topic, payload) {
        Ok(Some(message)) => Some(message),
        Ok(None) => {
            debug!(topic, "ignoring unrouted topic");
            None
        }
        Err(err) => {
            warn!(topic, "dropping inbound message: {err}");
            None
        }
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8], field: &'static str) -> Result<T, RouteError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(RouteError::PayloadTooLarge(payload.len()));
    }
    let text = std::str::from_utf8(payload).map_err(|_| RouteError::NotUtf8)?;
    serde_json::from_str(text).map_err(|err| RouteError::InvalidPayload {
        field,
        reason: err.to_string(),
    })
}

fn finite(value: f64, field: &'static str) -> Result<f64, RouteError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RouteError::NotFinite { field })
    }
}

/// Maps transport messages onto engine operations.
pub struct MessageRouter<S, P> {
    engine: Arc<ControlEngine<S, P>>,
}

impl<S, P> Clone for MessageRouter<S, P> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<S: ValveStore, P: CommandPublisher> MessageRouter<S, P> {
    pub fn new(engine: Arc<ControlEngine<S, P>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<ControlEngine<S, P>> {
        &self.engine
    }

    /// Never fails: bad input is logged and dropped.
    pub fn route(&self, topic: &str, payload: &[u8], now: DateTime<Utc>) {
        if let Some(message) = accept_message(topic, payload) {
            self.apply(message, now);
        }
    }

    pub fn apply(&self, message: InboundMessage, now: DateTime<Utc>) {
        match message {
            InboundMessage::Temperature { valve_id, value } => {
                self.engine.handle_temperature(&valve_id, value, now);
            }
            InboundMessage::Setpoint { valve_id, setpoint } => {
                self.engine.update_setpoint(&valve_id, setpoint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        config::EngineConfig, publisher::RecordingPublisher, store::MemoryStore,
        types::ValveState,
    };

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn router() -> MessageRouter<MemoryStore, RecordingPublisher> {
        MessageRouter::new(Arc::new(ControlEngine::new(
            EngineConfig::default(),
            MemoryStore::new(),
            RecordingPublisher::new(),
        )))
    }

    #[test]
    fn parses_temperature_and_setpoint() {
        assert_eq!(
            parse_message("home/valves/v1/temperature", br#"{"value": 20.5}"#).unwrap(),
            Some(InboundMessage::Temperature {
                valve_id: "v1".to_string(),
                value: 20.5
            })
        );
        assert_eq!(
            parse_message("home/thermostat/setpoint/v1", br#"{"setpoint": 19}"#).unwrap(),
            Some(InboundMessage::Setpoint {
                valve_id: "v1".to_string(),
                setpoint: 19.0
            })
        );
    }

    #[test]
    fn extra_payload_fields_are_tolerated() {
        let parsed =
            parse_message("home/valves/v1/temperature", br#"{"value": 20, "unit": "C"}"#).unwrap();
        assert_eq!(parsed.map(|m| m.valve_id().to_string()), Some("v1".to_string()));
    }

    #[test]
    fn rejects_bad_payloads() {
        let topic = "home/valves/v1/temperature";
        assert!(matches!(
            parse_message(topic, b"20.5"),
            Err(RouteError::InvalidPayload { field: "value", .. })
        ));
        assert!(matches!(
            parse_message(topic, br#"{"value": "warm"}"#),
            Err(RouteError::InvalidPayload { .. })
        ));
        assert!(matches!(
            parse_message(topic, br#"{"temp": 20}"#),
            Err(RouteError::InvalidPayload { .. })
        ));
        assert_eq!(parse_message(topic, &[0xff, 0xfe]), Err(RouteError::NotUtf8));
        assert_eq!(
            parse_message(topic, &vec![b' '; MAX_PAYLOAD_BYTES + 1]),
            Err(RouteError::PayloadTooLarge(MAX_PAYLOAD_BYTES + 1))
        );
    }

    #[test]
    fn malformed_and_unrelated_topics() {
        assert_eq!(
            parse_message("home/valves/v1/temperature/x", br#"{"value": 1}"#),
            Err(RouteError::MalformedTopic(
                "home/valves/v1/temperature/x".to_string()
            ))
        );
        assert_eq!(parse_message("home/valves/v1/command", br#"{"heating": true}"#), Ok(None));
        assert_eq!(parse_message("garage/door", b"open"), Ok(None));
    }

    #[test]
    fn accept_message_drops_what_does_not_parse() {
        assert_eq!(
            accept_message("home/valves/v1/temperature", br#"{"value": 19.5}"#),
            Some(InboundMessage::Temperature {
                valve_id: "v1".to_string(),
                value: 19.5
            })
        );
        assert_eq!(accept_message("home/valves/v1/temperature", b"{}"), None);
        assert_eq!(accept_message("home/valves//temperature", br#"{"value": 1}"#), None);
        assert_eq!(accept_message("garage/door", b"open"), None);
    }

    #[test]
    fn out_of_range_reading_still_reaches_engine() {
        let router = router();
        router.route("home/valves/v1/temperature", br#"{"value": 150.0}"#, at(0));

        let valve = router.engine().valve("v1").unwrap();
        assert_eq!(valve.current_temp, Some(150.0));
        assert_eq!(valve.state, ValveState::Idle);
    }

    #[test]
    fn route_drives_engine() {
        let router = router();
        router.route("home/valves/v1/temperature", br#"{"value": 18.0}"#, at(0));
        router.route("home/thermostat/setpoint/v1", br#"{"setpoint": 17.0}"#, at(1));
        router.route("home/valves/v1/temperature", br#"{"value": 17.2}"#, at(2));

        let valve = router.engine().valve("v1").unwrap();
        assert_eq!(valve.setpoint, 17.0);
        assert_eq!(valve.state, ValveState::Heating);
        assert_eq!(router.engine().publisher().messages().len(), 2);
    }

    #[test]
    fn route_drops_garbage_without_side_effects() {
        let router = router();
        router.route("home/valves/v1/temperature", b"not json", at(0));
        router.route("home/valves/v1/temperature", br#"{"value": "hot"}"#, at(0));
        router.route("home/valves/v1", br#"{"value": 20}"#, at(0));
        router.route("home/thermostat/setpoint/v1", br#"{"setpoint": 20}"#, at(0));

        assert!(router.engine().valve_ids().is_empty());
        assert!(router.engine().publisher().messages().is_empty());
    }
}
