use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Secondary metadata reported alongside an entity's primary state
pub type Attributes = HashMap<String, Value>;

/// Last known state of a tracked entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// Unique entity identifier (e.g., "sensor.living_room_temperature")
    pub entity_id: String,

    /// Primary value (e.g., "on", "21.4")
    pub state: String,

    /// Full, unfiltered attributes as last observed
    pub attributes: Attributes,

    /// When the state last really changed
    pub last_changed: DateTime<Utc>,

    /// When this record was last written, changed or not
    pub last_updated: DateTime<Utc>,
}

/// One entity reading delivered by a polling cycle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub observed_at: DateTime<Utc>,
}

/// Result of a state store update that differed from the stored record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub entity_id: String,

    /// `None` when the entity had never been observed before
    pub previous_state: Option<String>,
    pub current_state: String,
    pub previous_attributes: Option<Attributes>,
    pub current_attributes: Attributes,
    pub changed_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// First observation of this entity
    pub fn is_first_seen(&self) -> bool {
        self.previous_state.is_none()
    }

    /// Primary state differs (as opposed to an attribute-only change)
    pub fn state_changed(&self) -> bool {
        self.previous_state.as_deref() != Some(self.current_state.as_str())
    }
}
