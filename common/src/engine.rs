//! Per-valve control state machine.
//!
//! ```text
//!   reading ──▶ record ──▶ resolve band ──▶ resolve override ──▶ decide ──▶ publish ──▶ persist
//! ```
//!
//! Each valve has its own mutex, held for the whole sequence above so a
//! reading and an offline sweep for the same valve never interleave. The map
//! lock is only taken to find or create a slot, so distinct valves proceed in
//! parallel.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    publisher::CommandPublisher,
    store::{TemperatureReading, ValveStore, ValveUpsert},
    topics::command_topic,
    types::{CommandPayload, ValveState},
    valve::{ControlBand, Override, Valve},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Override,
    Hysteresis,
}

/// Outcome of one temperature reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub heating: bool,
    pub state: ValveState,
    pub band: ControlBand,
    pub source: DecisionSource,
}

type ValveSlot = Arc<Mutex<Valve>>;

pub struct ControlEngine<S, P> {
    config: EngineConfig,
    store: S,
    publisher: P,
    valves: RwLock<HashMap<String, ValveSlot>>,
}

impl<S: ValveStore, P: CommandPublisher> ControlEngine<S, P> {
    pub fn new(config: EngineConfig, store: S, publisher: P) -> Self {
        Self {
            config,
            store,
            publisher,
            valves: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Snapshot of the in-memory record.
    pub fn valve(&self, valve_id: &str) -> Option<Valve> {
        let slot = self.slot(valve_id)?;
        let valve = lock_valve(&slot).clone();
        Some(valve)
    }

    pub fn valve_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.read_map().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn handle_temperature(
        &self,
        valve_id: &str,
        temperature: f64,
        now: DateTime<Utc>,
    ) -> Decision {
        let slot = self.slot_or_insert(valve_id, now);
        let mut valve = lock_valve(&slot);

        valve.record_temperature(temperature, now);
        self.persist_reading(valve_id, temperature, &valve, now);

        let band = self.resolve_band(valve_id, &mut valve);
        let (heating, source) = match self.resolve_override(valve_id, now) {
            Some(active) => (valve.apply_override(&active), DecisionSource::Override),
            None => (
                valve.apply_hysteresis(temperature, band),
                DecisionSource::Hysteresis,
            ),
        };

        info!(
            valve_id,
            temperature,
            setpoint = band.setpoint,
            hysteresis = band.hysteresis,
            state = valve.state.as_str(),
            heating,
            source = ?source,
            "valve decision"
        );

        self.publish_command(valve_id, heating);

        if let Err(err) = self.store.upsert_valve(ValveUpsert {
            id: valve_id,
            setpoint: valve.setpoint,
            last_seen: valve.last_seen,
            state: Some(valve.state),
        }) {
            warn!(valve_id, "failed to persist valve state: {err}");
        }

        Decision {
            heating,
            state: valve.state,
            band,
            source,
        }
    }

    /// Returns false when the valve has not reported yet; nothing is created.
    pub fn update_setpoint(&self, valve_id: &str, setpoint: f64) -> bool {
        let Some(slot) = self.slot(valve_id) else {
            warn!(valve_id, setpoint, "setpoint update for unknown valve dropped");
            return false;
        };

        let mut valve = lock_valve(&slot);
        valve.setpoint = setpoint;
        info!(valve_id, setpoint, "setpoint updated");

        if let Err(err) = self.store.upsert_valve(ValveUpsert {
            id: valve_id,
            setpoint,
            last_seen: valve.last_seen,
            state: None,
        }) {
            warn!(valve_id, "failed to persist setpoint: {err}");
        }
        true
    }

    /// One offline-detection pass. Returns the valves that went offline.
    pub fn sweep_offline(&self, now: DateTime<Utc>) -> Vec<String> {
        let slots: Vec<(String, ValveSlot)> = self
            .read_map()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let timeout = self.config.offline_timeout();
        let mut transitioned = Vec::new();

        for (valve_id, slot) in slots {
            let mut valve = lock_valve(&slot);
            if !valve.mark_offline(now, timeout) {
                continue;
            }

            let silence_ms = (now - valve.last_seen).num_milliseconds();
            info!(valve_id = %valve_id, silence_ms, "valve marked offline");

            if let Err(err) = self.store.upsert_valve(ValveUpsert {
                id: &valve_id,
                setpoint: valve.setpoint,
                last_seen: valve.last_seen,
                state: Some(ValveState::Offline),
            }) {
                warn!(valve_id = %valve_id, "failed to persist offline state: {err}");
            }
            transitioned.push(valve_id);
        }

        transitioned
    }

    fn persist_reading(
        &self,
        valve_id: &str,
        temperature: f64,
        valve: &Valve,
        now: DateTime<Utc>,
    ) {
        let reading = TemperatureReading {
            valve_id: valve_id.to_string(),
            temperature,
            timestamp: now,
        };
        if let Err(err) = self.store.append_reading(&reading) {
            warn!(valve_id, "failed to append temperature reading: {err}");
        }

        if let Err(err) = self.store.upsert_valve(ValveUpsert {
            id: valve_id,
            setpoint: valve.setpoint,
            last_seen: valve.last_seen,
            state: None,
        }) {
            warn!(valve_id, "failed to persist valve record: {err}");
        }
    }

    /// Room settings win over the valve's own setpoint; the valve mirrors the
    /// room target so displays stay consistent.
    fn resolve_band(&self, valve_id: &str, valve: &mut Valve) -> ControlBand {
        let own = ControlBand::new(valve.setpoint, self.config.default_hysteresis);

        let room_id = match self.store.get_valve(valve_id) {
            Ok(Some(record)) => record.room_id,
            Ok(None) => None,
            Err(err) => {
                warn!(valve_id, "valve lookup failed, using last known setpoint: {err}");
                return own;
            }
        };
        let Some(room_id) = room_id else {
            return own;
        };

        match self.store.get_room(&room_id) {
            Ok(Some(room)) => {
                valve.setpoint = room.target_temp;
                ControlBand::new(room.target_temp, room.hysteresis)
            }
            Ok(None) => {
                debug!(valve_id, room_id = %room_id, "assigned room no longer exists");
                own
            }
            Err(err) => {
                warn!(valve_id, room_id = %room_id, "room lookup failed, using last known setpoint: {err}");
                own
            }
        }
    }

    /// Expired overrides are cleared here, lazily, on the next reading.
    fn resolve_override(&self, valve_id: &str, now: DateTime<Utc>) -> Option<Override> {
        let stored = match self.store.get_override(valve_id) {
            Ok(stored) => stored?,
            Err(err) => {
                warn!(valve_id, "override lookup failed, treating as absent: {err}");
                return None;
            }
        };

        if stored.is_active(now) {
            return Some(stored);
        }

        info!(valve_id, expires = ?stored.expires, "override expired");
        if let Err(err) = self.store.clear_override(valve_id) {
            warn!(valve_id, "failed to clear expired override: {err}");
        }
        None
    }

    fn publish_command(&self, valve_id: &str, heating: bool) {
        let payload = match serde_json::to_vec(&CommandPayload { heating }) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(valve_id, "command serialization failed: {err}");
                return;
            }
        };

        if let Err(err) = self
            .publisher
            .publish(&command_topic(valve_id), payload, false)
        {
            warn!(valve_id, "command publish failed: {err}");
        }
    }

    fn slot(&self, valve_id: &str) -> Option<ValveSlot> {
        self.read_map().get(valve_id).cloned()
    }

    fn slot_or_insert(&self, valve_id: &str, now: DateTime<Utc>) -> ValveSlot {
        if let Some(slot) = self.slot(valve_id) {
            return slot;
        }

        let mut valves = self.valves.write().unwrap_or_else(PoisonError::into_inner);
        let slot = valves.entry(valve_id.to_string()).or_insert_with(|| {
            info!(valve_id, "new valve detected");
            Arc::new(Mutex::new(Valve::new(self.config.default_setpoint, now)))
        });
        Arc::clone(slot)
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ValveSlot>> {
        self.valves.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_valve(slot: &ValveSlot) -> MutexGuard<'_, Valve> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
