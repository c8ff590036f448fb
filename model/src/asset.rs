use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{AssetId, LatLng};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Active,
    Idle,
    Maintenance,
    Alert,
}

/// One truck or piece of equipment in a fleet snapshot. Snapshots are replaced wholesale on each
/// refresh, so these are never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetPoint {
    pub id: AssetId,
    #[serde(default)]
    pub name: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub status: AssetStatus,
    #[serde(default, rename = "hasAlert", alias = "has_alert")]
    pub has_alert: bool,
    #[serde(default)]
    pub reported_at: Option<NaiveDateTime>,
}

impl AssetPoint {
    pub fn new(id: AssetId, pos: LatLng, status: AssetStatus) -> Self {
        Self {
            id,
            name: None,
            lat: pos.lat,
            lng: pos.lng,
            status,
            has_alert: status == AssetStatus::Alert,
            reported_at: None,
        }
    }

    pub fn pos(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }

    /// Out-of-range coordinates are as unusable as NaNs for clustering and animation.
    pub fn has_valid_position(&self) -> bool {
        self.pos().is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// The name shown on markers and alerts
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id.0)
    }
}
