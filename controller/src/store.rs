//! SQLite persistence shared with the administrative layer.
//!
//! Nothing is cached: every lookup reads the database, so rooms and overrides
//! written by another connection are seen on the next reading, and engine
//! upserts only touch the columns the engine owns.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use tracing::info;

use valve_common::{
    store::{DEFAULT_ROOM_HYSTERESIS, DEFAULT_ROOM_TARGET, PLACEHOLDER_SETPOINT},
    Override, RoomRecord, RuntimeConfig, StoreError, TemperatureReading, ValveRecord, ValveState,
    ValveStore, ValveUpsert,
};

const DATABASE_FILE: &str = "valves.db";
const RUNTIME_FILE: &str = "runtime.json";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS valves (
    id TEXT PRIMARY KEY,
    setpoint REAL,
    last_seen REAL
);
CREATE TABLE IF NOT EXISTS temperature_readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    valve_id TEXT,
    temperature REAL,
    timestamp REAL,
    FOREIGN KEY(valve_id) REFERENCES valves(id)
);
CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY,
    name TEXT,
    target_temp REAL DEFAULT 21.0,
    hysteresis REAL DEFAULT 0.5
);
CREATE INDEX IF NOT EXISTS idx_readings_valve_ts ON temperature_readings(valve_id, timestamp);
";

/// Valve columns added after the first schema. Older databases gain them on open.
const VALVE_COLUMNS: [(&str, &str); 4] = [
    ("room_id", "TEXT"),
    ("override_heating", "INTEGER"),
    ("override_expires", "REAL"),
    ("state", "INTEGER DEFAULT 0"),
];

const VALVE_SELECT: &str = "SELECT id, setpoint, last_seen, room_id, override_heating, \
     override_expires, state FROM valves";
const ROOM_SELECT: &str = "SELECT id, name, target_temp, hysteresis FROM rooms";

/// Timestamps are stored as epoch seconds and state as its integer code.
pub struct SqliteStore {
    dir: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn data_dir_from_env() -> PathBuf {
        std::env::var("VALVE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.valves"))
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let conn = Connection::open(dir.join(DATABASE_FILE)).map_err(db)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(db)?;
        migrate(&conn)?;

        Ok(Self {
            dir,
            conn: Mutex::new(conn),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.dir.join(DATABASE_FILE)
    }

    /// Missing file means defaults.
    pub fn load_runtime_config(&self) -> Result<RuntimeConfig, StoreError> {
        match fs::read(self.dir.join(RUNTIME_FILE)) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ValveStore for SqliteStore {
    fn upsert_valve(&self, upsert: ValveUpsert<'_>) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO valves (id, setpoint, last_seen, state)
                 VALUES (?1, ?2, ?3, COALESCE(?4, 0))
                 ON CONFLICT(id) DO UPDATE SET
                     setpoint = excluded.setpoint,
                     last_seen = excluded.last_seen,
                     state = COALESCE(?4, valves.state)",
                params![
                    upsert.id,
                    upsert.setpoint,
                    to_epoch(upsert.last_seen),
                    upsert.state.map(ValveState::code),
                ],
            )
            .map_err(db)?;
        Ok(())
    }

    fn append_reading(&self, reading: &TemperatureReading) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO temperature_readings (valve_id, temperature, timestamp)
                 VALUES (?1, ?2, ?3)",
                params![
                    reading.valve_id,
                    reading.temperature,
                    to_epoch(reading.timestamp)
                ],
            )
            .map_err(db)?;
        Ok(())
    }

    fn get_valve(&self, valve_id: &str) -> Result<Option<ValveRecord>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("{VALVE_SELECT} WHERE id = ?1"),
                params![valve_id],
                ValveRow::from_row,
            )
            .optional()
            .map_err(db)?;
        row.map(ValveRecord::try_from).transpose()
    }

    fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        self.conn()
            .query_row(
                &format!("{ROOM_SELECT} WHERE id = ?1"),
                params![room_id],
                room_from_row,
            )
            .optional()
            .map_err(db)
    }

    fn get_override(&self, valve_id: &str) -> Result<Option<Override>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT override_heating, override_expires FROM valves WHERE id = ?1",
                params![valve_id],
                |row| Ok((row.get::<_, Option<bool>>(0)?, row.get::<_, Option<f64>>(1)?)),
            )
            .optional()
            .map_err(db)?;

        match row {
            Some((Some(heating), expires)) => Ok(Some(Override {
                heating,
                expires: expires.map(from_epoch).transpose()?,
            })),
            _ => Ok(None),
        }
    }

    fn set_override(&self, valve_id: &str, value: Override) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db)?;
        ensure_valve(&tx, valve_id)?;
        tx.execute(
            "UPDATE valves SET override_heating = ?2, override_expires = ?3 WHERE id = ?1",
            params![valve_id, value.heating, value.expires.map(to_epoch)],
        )
        .map_err(db)?;
        tx.commit().map_err(db)
    }

    fn clear_override(&self, valve_id: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE valves SET override_heating = NULL, override_expires = NULL WHERE id = ?1",
                params![valve_id],
            )
            .map_err(db)?;
        Ok(())
    }

    fn upsert_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO rooms (id, name, target_temp, hysteresis) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     target_temp = excluded.target_temp,
                     hysteresis = excluded.hysteresis",
                params![room.id, room.name, room.target_temp, room.hysteresis],
            )
            .map_err(db)?;
        Ok(())
    }

    fn assign_room(&self, valve_id: &str, room_id: Option<&str>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db)?;
        ensure_valve(&tx, valve_id)?;
        tx.execute(
            "UPDATE valves SET room_id = ?2 WHERE id = ?1",
            params![valve_id, room_id],
        )
        .map_err(db)?;
        tx.commit().map_err(db)
    }

    fn delete_valve(&self, valve_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            "DELETE FROM temperature_readings WHERE valve_id = ?1",
            params![valve_id],
        )
        .map_err(db)?;
        tx.execute("DELETE FROM valves WHERE id = ?1", params![valve_id])
            .map_err(db)?;
        tx.commit().map_err(db)
    }

    fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            "UPDATE valves SET room_id = NULL WHERE room_id = ?1",
            params![room_id],
        )
        .map_err(db)?;
        tx.execute("DELETE FROM rooms WHERE id = ?1", params![room_id])
            .map_err(db)?;
        tx.commit().map_err(db)
    }

    fn list_valves(&self) -> Result<Vec<ValveRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("{VALVE_SELECT} ORDER BY id"))
            .map_err(db)?;
        let rows = stmt.query_map([], ValveRow::from_row).map_err(db)?;

        let mut valves = Vec::new();
        for row in rows {
            valves.push(ValveRecord::try_from(row.map_err(db)?)?);
        }
        Ok(valves)
    }

    fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("{ROOM_SELECT} ORDER BY id"))
            .map_err(db)?;
        let rooms = stmt
            .query_map([], room_from_row)
            .map_err(db)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)?;
        Ok(rooms)
    }

    fn valve_history(
        &self,
        valve_id: &str,
        limit: usize,
    ) -> Result<Vec<TemperatureReading>, StoreError> {
        collect_readings(
            &self.conn(),
            "SELECT valve_id, temperature, timestamp FROM temperature_readings
             WHERE valve_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
            params![valve_id, sql_limit(limit)],
        )
    }

    fn room_history(
        &self,
        room_id: &str,
        limit: usize,
    ) -> Result<Vec<TemperatureReading>, StoreError> {
        collect_readings(
            &self.conn(),
            "SELECT t.valve_id, t.temperature, t.timestamp
             FROM temperature_readings t
             JOIN valves v ON t.valve_id = v.id
             WHERE v.room_id = ?1
             ORDER BY t.timestamp DESC, t.id DESC
             LIMIT ?2",
            params![room_id, sql_limit(limit)],
        )
    }
}

struct ValveRow {
    id: String,
    setpoint: f64,
    last_seen: f64,
    room_id: Option<String>,
    override_heating: Option<bool>,
    override_expires: Option<f64>,
    state: Option<u8>,
}

impl ValveRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            setpoint: row.get(1)?,
            last_seen: row.get(2)?,
            room_id: row.get(3)?,
            override_heating: row.get(4)?,
            override_expires: row.get(5)?,
            state: row.get(6)?,
        })
    }
}

impl TryFrom<ValveRow> for ValveRecord {
    type Error = StoreError;

    fn try_from(row: ValveRow) -> Result<Self, Self::Error> {
        let manual_override = match row.override_heating {
            Some(heating) => Some(Override {
                heating,
                expires: row.override_expires.map(from_epoch).transpose()?,
            }),
            None => None,
        };

        Ok(Self {
            state: ValveState::from_code(row.state.unwrap_or_default())?,
            last_seen: from_epoch(row.last_seen)?,
            manual_override,
            id: row.id,
            setpoint: row.setpoint,
            room_id: row.room_id,
        })
    }
}

fn room_from_row(row: &Row<'_>) -> rusqlite::Result<RoomRecord> {
    Ok(RoomRecord {
        id: row.get(0)?,
        name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        target_temp: row.get::<_, Option<f64>>(2)?.unwrap_or(DEFAULT_ROOM_TARGET),
        hysteresis: row
            .get::<_, Option<f64>>(3)?
            .unwrap_or(DEFAULT_ROOM_HYSTERESIS),
    })
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA).map_err(db)?;

    let existing = valve_columns(conn)?;
    for (column, declaration) in VALVE_COLUMNS {
        if existing.iter().any(|name| name == column) {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE valves ADD COLUMN {column} {declaration}"
        ))
        .map_err(db)?;
        info!(column, "added missing valve column");
    }

    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_valves_room_id ON valves(room_id)")
        .map_err(db)
}

fn valve_columns(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("PRAGMA table_info(valves)").map_err(db)?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(db)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db)?;
    Ok(columns)
}

/// Rows created by administrative writes start from the placeholder setpoint.
fn ensure_valve(conn: &Connection, valve_id: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO valves (id, setpoint, last_seen, state) VALUES (?1, ?2, ?3, 0)",
        params![valve_id, PLACEHOLDER_SETPOINT, to_epoch(Utc::now())],
    )
    .map_err(db)?;
    Ok(())
}

fn collect_readings<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<TemperatureReading>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(db)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })
        .map_err(db)?;

    let mut readings = Vec::new();
    for row in rows {
        let (valve_id, temperature, timestamp) = row.map_err(db)?;
        readings.push(TemperatureReading {
            valve_id,
            temperature,
            timestamp: from_epoch(timestamp)?,
        });
    }
    Ok(readings)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn to_epoch(timestamp: DateTime<Utc>) -> f64 {
    timestamp.timestamp_micros() as f64 / 1_000_000.0
}

fn from_epoch(secs: f64) -> Result<DateTime<Utc>, StoreError> {
    if !secs.is_finite() {
        return Err(StoreError::InvalidTimestamp(secs));
    }
    let micros = (secs * 1_000_000.0).round() as i64;
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(micros.div_euclid(1_000_000), nanos)
        .ok_or(StoreError::InvalidTimestamp(secs))
}

fn db(err: rusqlite::Error) -> StoreError {
    StoreError::Database(err.to_string())
}
