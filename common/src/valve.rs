use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ValveState;

/// Dead band around an effective setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlBand {
    pub setpoint: f64,
    pub hysteresis: f64,
}

impl ControlBand {
    pub fn new(setpoint: f64, hysteresis: f64) -> Self {
        Self {
            setpoint,
            hysteresis,
        }
    }

    pub fn lower(&self) -> f64 {
        self.setpoint - self.hysteresis
    }

    pub fn upper(&self) -> f64 {
        self.setpoint + self.hysteresis
    }
}

/// Manual heating override. `expires: None` holds until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub heating: bool,
    pub expires: Option<DateTime<Utc>>,
}

impl Override {
    pub fn until_cleared(heating: bool) -> Self {
        Self {
            heating,
            expires: None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|expires| expires > now).unwrap_or(true)
    }
}

/// In-memory control record for one valve.
#[derive(Debug, Clone, PartialEq)]
pub struct Valve {
    pub setpoint: f64,
    pub current_temp: Option<f64>,
    pub state: ValveState,
    pub last_seen: DateTime<Utc>,
}

impl Valve {
    pub fn new(setpoint: f64, now: DateTime<Utc>) -> Self {
        Self {
            setpoint,
            current_temp: None,
            state: ValveState::Idle,
            last_seen: now,
        }
    }

    pub fn record_temperature(&mut self, temperature: f64, now: DateTime<Utc>) {
        self.current_temp = Some(temperature);
        self.last_seen = now;
    }

    /// Forces the state from an active override and returns the heating command.
    pub fn apply_override(&mut self, active: &Override) -> bool {
        self.state = if active.heating {
            ValveState::Heating
        } else {
            ValveState::Idle
        };
        active.heating
    }

    /// Dead-band control. Inside the band the prior state is kept, except that
    /// a reading always leaves `Offline`.
    pub fn apply_hysteresis(&mut self, temperature: f64, band: ControlBand) -> bool {
        if temperature < band.lower() {
            self.state = ValveState::Heating;
        } else if temperature > band.upper() {
            self.state = ValveState::Idle;
        } else if self.state == ValveState::Offline {
            self.state = ValveState::Idle;
        }
        self.state == ValveState::Heating
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match (now - self.last_seen).to_std() {
            Ok(silence) => silence > timeout,
            // last_seen in the future: clock stepped backwards
            Err(_) => false,
        }
    }

    /// Returns true only on the transition into `Offline`.
    pub fn mark_offline(&mut self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.state == ValveState::Offline || !self.is_stale(now, timeout) {
            return false;
        }
        self.state = ValveState::Offline;
        true
    }
}
