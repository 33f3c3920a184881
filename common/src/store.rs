//! Persistence gateway consumed by the control engine.
//!
//! Every operation is synchronous and fallible. The engine treats each
//! failure as recoverable: it logs and keeps controlling from memory.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, types::ValveState, valve::Override};

pub const DEFAULT_ROOM_TARGET: f64 = 21.0;
pub const DEFAULT_ROOM_HYSTERESIS: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct ValveRecord {
    pub id: String,
    pub setpoint: f64,
    pub last_seen: DateTime<Utc>,
    pub room_id: Option<String>,
    pub manual_override: Option<Override>,
    pub state: ValveState,
}

/// Columns the engine owns. Room assignment and override are never touched.
#[derive(Debug, Clone, PartialEq)]
pub struct ValveUpsert<'a> {
    pub id: &'a str,
    pub setpoint: f64,
    pub last_seen: DateTime<Utc>,
    pub state: Option<ValveState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: String,
    pub name: String,
    pub target_temp: f64,
    pub hysteresis: f64,
}

impl RoomRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            target_temp: DEFAULT_ROOM_TARGET,
            hysteresis: DEFAULT_ROOM_HYSTERESIS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub valve_id: String,
    pub temperature: f64,
    pub timestamp: DateTime<Utc>,
}

pub trait ValveStore: Send + Sync {
    fn upsert_valve(&self, upsert: ValveUpsert<'_>) -> Result<(), StoreError>;
    fn append_reading(&self, reading: &TemperatureReading) -> Result<(), StoreError>;
    fn get_valve(&self, valve_id: &str) -> Result<Option<ValveRecord>, StoreError>;
    fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError>;
    fn get_override(&self, valve_id: &str) -> Result<Option<Override>, StoreError>;
    fn set_override(&self, valve_id: &str, value: Override) -> Result<(), StoreError>;
    fn clear_override(&self, valve_id: &str) -> Result<(), StoreError>;

    fn upsert_room(&self, room: &RoomRecord) -> Result<(), StoreError>;
    fn assign_room(&self, valve_id: &str, room_id: Option<&str>) -> Result<(), StoreError>;
    fn delete_valve(&self, valve_id: &str) -> Result<(), StoreError>;
    fn delete_room(&self, room_id: &str) -> Result<(), StoreError>;
    /// Sorted by id.
    fn list_valves(&self) -> Result<Vec<ValveRecord>, StoreError>;
    /// Sorted by id.
    fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError>;
    /// Newest first.
    fn valve_history(
        &self,
        valve_id: &str,
        limit: usize,
    ) -> Result<Vec<TemperatureReading>, StoreError>;
    /// Readings of every valve currently assigned to the room, newest first.
    fn room_history(
        &self,
        room_id: &str,
        limit: usize,
    ) -> Result<Vec<TemperatureReading>, StoreError>;
}

/// Setpoint written for valve rows created by administrative actions.
pub const PLACEHOLDER_SETPOINT: f64 = 22.0;

/// Store operations, for targeted fault injection in [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    UpsertValve,
    AppendReading,
    GetValve,
    GetRoom,
    GetOverride,
    SetOverride,
    ClearOverride,
    UpsertRoom,
    AssignRoom,
    DeleteValve,
    DeleteRoom,
    ListValves,
    ListRooms,
    ValveHistory,
    RoomHistory,
}

#[derive(Debug, Default)]
struct Tables {
    valves: HashMap<String, ValveRecord>,
    rooms: HashMap<String, RoomRecord>,
    readings: Vec<TemperatureReading>,
}

impl Tables {
    fn ensure_valve(&mut self, valve_id: &str) -> &mut ValveRecord {
        self.valves
            .entry(valve_id.to_string())
            .or_insert_with(|| ValveRecord {
                id: valve_id.to_string(),
                setpoint: PLACEHOLDER_SETPOINT,
                last_seen: Utc::now(),
                room_id: None,
                manual_override: None,
                state: ValveState::Idle,
            })
    }

    fn newest_first(
        &self,
        limit: usize,
        keep: impl Fn(&TemperatureReading) -> bool,
    ) -> Vec<TemperatureReading> {
        let mut history: Vec<_> = self.readings.iter().filter(|reading| keep(*reading)).cloned().collect();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        history.truncate(limit);
        history
    }
}

/// In-process store for tests. `set_failing(true)` makes every call fail;
/// `fail_on` fails a single operation while the rest keep working.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing: AtomicBool,
    failing_ops: Mutex<HashSet<StoreOp>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn fail_on(&self, op: StoreOp) {
        lock(&self.failing_ops).insert(op);
    }

    pub fn recover(&self, op: StoreOp) {
        lock(&self.failing_ops).remove(&op);
    }

    /// Every reading in append order.
    pub fn readings(&self) -> Vec<TemperatureReading> {
        self.tables().readings.clone()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Relaxed) || lock(&self.failing_ops).contains(&op) {
            return Err(StoreError::Unavailable(format!("{op:?} set to fail")));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ValveStore for MemoryStore {
    fn upsert_valve(&self, upsert: ValveUpsert<'_>) -> Result<(), StoreError> {
        self.check(StoreOp::UpsertValve)?;
        let mut tables = self.tables();
        let row = tables
            .valves
            .entry(upsert.id.to_string())
            .or_insert_with(|| ValveRecord {
                id: upsert.id.to_string(),
                setpoint: upsert.setpoint,
                last_seen: upsert.last_seen,
                room_id: None,
                manual_override: None,
                state: ValveState::Idle,
            });
        row.setpoint = upsert.setpoint;
        row.last_seen = upsert.last_seen;
        if let Some(state) = upsert.state {
            row.state = state;
        }
        Ok(())
    }

    fn append_reading(&self, reading: &TemperatureReading) -> Result<(), StoreError> {
        self.check(StoreOp::AppendReading)?;
        self.tables().readings.push(reading.clone());
        Ok(())
    }

    fn get_valve(&self, valve_id: &str) -> Result<Option<ValveRecord>, StoreError> {
        self.check(StoreOp::GetValve)?;
        Ok(self.tables().valves.get(valve_id).cloned())
    }

    fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        self.check(StoreOp::GetRoom)?;
        Ok(self.tables().rooms.get(room_id).cloned())
    }

    fn get_override(&self, valve_id: &str) -> Result<Option<Override>, StoreError> {
        self.check(StoreOp::GetOverride)?;
        Ok(self
            .tables()
            .valves
            .get(valve_id)
            .and_then(|valve| valve.manual_override))
    }

    fn set_override(&self, valve_id: &str, value: Override) -> Result<(), StoreError> {
        self.check(StoreOp::SetOverride)?;
        self.tables().ensure_valve(valve_id).manual_override = Some(value);
        Ok(())
    }

    fn clear_override(&self, valve_id: &str) -> Result<(), StoreError> {
        self.check(StoreOp::ClearOverride)?;
        if let Some(valve) = self.tables().valves.get_mut(valve_id) {
            valve.manual_override = None;
        }
        Ok(())
    }

    fn upsert_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        self.check(StoreOp::UpsertRoom)?;
        self.tables().rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    fn assign_room(&self, valve_id: &str, room_id: Option<&str>) -> Result<(), StoreError> {
        self.check(StoreOp::AssignRoom)?;
        self.tables().ensure_valve(valve_id).room_id = room_id.map(str::to_string);
        Ok(())
    }

    fn delete_valve(&self, valve_id: &str) -> Result<(), StoreError> {
        self.check(StoreOp::DeleteValve)?;
        let mut tables = self.tables();
        tables.valves.remove(valve_id);
        tables.readings.retain(|reading| reading.valve_id != valve_id);
        Ok(())
    }

    fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        self.check(StoreOp::DeleteRoom)?;
        let mut tables = self.tables();
        for valve in tables.valves.values_mut() {
            if valve.room_id.as_deref() == Some(room_id) {
                valve.room_id = None;
            }
        }
        tables.rooms.remove(room_id);
        Ok(())
    }

    fn list_valves(&self) -> Result<Vec<ValveRecord>, StoreError> {
        self.check(StoreOp::ListValves)?;
        let mut valves: Vec<_> = self.tables().valves.values().cloned().collect();
        valves.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(valves)
    }

    fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
        self.check(StoreOp::ListRooms)?;
        let mut rooms: Vec<_> = self.tables().rooms.values().cloned().collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rooms)
    }

    fn valve_history(
        &self,
        valve_id: &str,
        limit: usize,
    ) -> Result<Vec<TemperatureReading>, StoreError> {
        self.check(StoreOp::ValveHistory)?;
        Ok(self
            .tables()
            .newest_first(limit, |reading| reading.valve_id == valve_id))
    }

    fn room_history(
        &self,
        room_id: &str,
        limit: usize,
    ) -> Result<Vec<TemperatureReading>, StoreError> {
        self.check(StoreOp::RoomHistory)?;
        let tables = self.tables();
        let members: HashSet<&str> = tables
            .valves
            .values()
            .filter(|valve| valve.room_id.as_deref() == Some(room_id))
            .map(|valve| valve.id.as_str())
            .collect();
        Ok(tables.newest_first(limit, |reading| members.contains(reading.valve_id.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(valve_id: &str, temperature: f64, secs: i64) -> TemperatureReading {
        TemperatureReading {
            valve_id: valve_id.to_string(),
            temperature,
            timestamp: at(secs),
        }
    }

    #[test]
    fn upsert_preserves_room_and_override() {
        let store = MemoryStore::new();
        store.assign_room("v1", Some("living")).unwrap();
        store
            .set_override("v1", Override::until_cleared(true))
            .unwrap();

        store
            .upsert_valve(ValveUpsert {
                id: "v1",
                setpoint: 19.5,
                last_seen: at(5),
                state: Some(ValveState::Heating),
            })
            .unwrap();

        let row = store.get_valve("v1").unwrap().unwrap();
        assert_eq!(row.room_id.as_deref(), Some("living"));
        assert_eq!(row.manual_override, Some(Override::until_cleared(true)));
        assert_eq!(row.setpoint, 19.5);
        assert_eq!(row.state, ValveState::Heating);
    }

    #[test]
    fn upsert_without_state_keeps_previous_state() {
        let store = MemoryStore::new();
        let mut upsert = ValveUpsert {
            id: "v1",
            setpoint: 21.0,
            last_seen: at(0),
            state: Some(ValveState::Offline),
        };
        store.upsert_valve(upsert.clone()).unwrap();
        upsert.state = None;
        upsert.last_seen = at(1);
        store.upsert_valve(upsert).unwrap();

        let row = store.get_valve("v1").unwrap().unwrap();
        assert_eq!(row.state, ValveState::Offline);
        assert_eq!(row.last_seen, at(1));
    }

    #[test]
    fn delete_valve_cascades_readings() {
        let store = MemoryStore::new();
        store.append_reading(&reading("v1", 20.0, 0)).unwrap();
        store.append_reading(&reading("v2", 20.0, 0)).unwrap();
        store.assign_room("v1", None).unwrap();

        store.delete_valve("v1").unwrap();

        assert!(store.get_valve("v1").unwrap().is_none());
        assert_eq!(store.readings(), vec![reading("v2", 20.0, 0)]);
    }

    #[test]
    fn delete_room_unassigns_valves() {
        let store = MemoryStore::new();
        store.upsert_room(&RoomRecord::new("living", "Living")).unwrap();
        store.assign_room("v1", Some("living")).unwrap();

        store.delete_room("living").unwrap();

        assert!(store.get_room("living").unwrap().is_none());
        assert_eq!(store.get_valve("v1").unwrap().unwrap().room_id, None);
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let store = MemoryStore::new();
        for (secs, temp) in [(0, 19.0), (10, 19.5), (20, 20.0)] {
            store.append_reading(&reading("v1", temp, secs)).unwrap();
        }

        let history = store.valve_history("v1", 2).unwrap();
        assert_eq!(history, vec![reading("v1", 20.0, 20), reading("v1", 19.5, 10)]);
    }

    #[test]
    fn room_listing_and_history() {
        let store = MemoryStore::new();
        store.upsert_room(&RoomRecord::new("office", "Office")).unwrap();
        store.upsert_room(&RoomRecord::new("bath", "Bath")).unwrap();
        store.assign_room("v1", Some("office")).unwrap();
        store.assign_room("v2", Some("office")).unwrap();
        store.assign_room("v3", Some("bath")).unwrap();
        let readings = [
            ("v1", 19.0, 0),
            ("v2", 19.5, 5),
            ("v3", 23.0, 6),
            ("v1", 20.0, 10),
        ];
        for (valve_id, temp, secs) in readings {
            store.append_reading(&reading(valve_id, temp, secs)).unwrap();
        }

        let rooms: Vec<String> = store.list_rooms().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(rooms, vec!["bath".to_string(), "office".to_string()]);
        let valves: Vec<String> = store.list_valves().unwrap().into_iter().map(|v| v.id).collect();
        assert_eq!(valves, vec!["v1".to_string(), "v2".to_string(), "v3".to_string()]);
        assert_eq!(
            store.room_history("office", 2).unwrap(),
            vec![reading("v1", 20.0, 10), reading("v2", 19.5, 5)]
        );
        assert!(store.room_history("attic", 10).unwrap().is_empty());
    }

    #[test]
    fn single_operation_can_fail() {
        let store = MemoryStore::new();
        store.set_override("v1", Override::until_cleared(true)).unwrap();
        store.fail_on(StoreOp::GetOverride);

        assert!(matches!(
            store.get_override("v1"),
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get_valve("v1").unwrap().is_some());

        store.recover(StoreOp::GetOverride);
        assert_eq!(
            store.get_override("v1").unwrap(),
            Some(Override::until_cleared(true))
        );
    }

    #[test]
    fn failing_store_errors_every_call() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.get_valve("v1"),
            Err(StoreError::Unavailable(_))
        ));
        store.set_failing(false);
        assert!(store.get_valve("v1").unwrap().is_none());
    }
}
