pub mod config;
pub mod engine;
pub mod error;
pub mod publisher;
pub mod router;
pub mod store;
pub mod topics;
pub mod types;
pub mod valve;

pub use config::{DispatchConfig, EngineConfig, NetworkConfig, RuntimeConfig};
pub use engine::{ControlEngine, Decision, DecisionSource};
pub use error::{PublishError, RouteError, StoreError};
pub use publisher::{CommandPublisher, PublishedMessage, RecordingPublisher};
pub use router::{accept_message, parse_message, InboundMessage, MessageRouter};
pub use store::{
    MemoryStore, RoomRecord, StoreOp, TemperatureReading, ValveRecord, ValveStore, ValveUpsert,
};
pub use topics::*;
pub use types::{AnnouncePayload, CommandPayload, SetpointPayload, TemperaturePayload, ValveState};
pub use valve::{ControlBand, Override, Valve};
