use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Live control state of a single valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValveState {
    Idle,
    Heating,
    Offline,
}

impl ValveState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Heating => "HEATING",
            Self::Offline => "OFFLINE",
        }
    }

    /// Integer code used by the persisted valve table.
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Heating => 1,
            Self::Offline => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, StoreError> {
        match code {
            0 => Ok(Self::Idle),
            1 => Ok(Self::Heating),
            2 => Ok(Self::Offline),
            other => Err(StoreError::UnknownStateCode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperaturePayload {
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetpointPayload {
    pub setpoint: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub heating: bool,
}

/// Retained presence message published by simulated valves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncePayload {
    pub id: String,
    pub ts: f64,
    pub proto: String,
}
