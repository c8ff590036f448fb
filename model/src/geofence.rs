use serde::{Deserialize, Serialize};

use crate::{LatLng, ShapeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeType {
    Circle,
    Polygon,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeofenceStatus {
    Active,
    Inactive,
}

impl GeofenceStatus {
    pub fn toggled(self) -> Self {
        match self {
            GeofenceStatus::Active => GeofenceStatus::Inactive,
            GeofenceStatus::Inactive => GeofenceStatus::Active,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GeofenceShape {
    Circle { center: LatLng, radius_meters: f64 },
    /// The ring may or may not repeat the first vertex at the end.
    Polygon { ring: Vec<LatLng> },
}

impl GeofenceShape {
    pub fn shape_type(&self) -> ShapeType {
        match self {
            GeofenceShape::Circle { .. } => ShapeType::Circle,
            GeofenceShape::Polygon { .. } => ShapeType::Polygon,
        }
    }
}

/// A user-drawn region. The persisted copy lives on the server; this is the working copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: ShapeId,
    pub name: String,
    pub shape: GeofenceShape,
    pub status: GeofenceStatus,
    #[serde(default)]
    pub account_ids: Vec<i64>,
}

impl Geofence {
    pub fn is_active(&self) -> bool {
        self.status == GeofenceStatus::Active
    }
}

/// Returns the ring with the first vertex repeated at the end, unless it's already closed.
pub fn close_ring(ring: &[LatLng]) -> Vec<LatLng> {
    let mut pts = ring.to_vec();
    if let (Some(first), Some(last)) = (ring.first(), ring.last()) {
        if ring.len() > 1 && first != last {
            pts.push(*first);
        }
    }
    pts
}

/// How many vertices remain after removing consecutive duplicates and the closing vertex. A usable
/// polygon needs at least 3.
pub fn distinct_vertices(ring: &[LatLng]) -> usize {
    let mut pts = ring.to_vec();
    pts.dedup();
    if pts.len() > 1 && pts.first() == pts.last() {
        pts.pop();
    }
    pts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<LatLng> {
        vec![
            LatLng::new(0.0, 0.0),
            LatLng::new(0.0, 1.0),
            LatLng::new(1.0, 1.0),
            LatLng::new(1.0, 0.0),
        ]
    }

    #[test]
    fn closing_open_and_closed_rings() {
        let closed = close_ring(&square());
        assert_eq!(closed.len(), 5);
        assert_eq!(closed.first(), closed.last());

        // Already closed rings are left alone
        assert_eq!(close_ring(&closed), closed);
        assert!(close_ring(&[]).is_empty());
    }

    #[test]
    fn counting_distinct_vertices() {
        assert_eq!(distinct_vertices(&square()), 4);
        assert_eq!(distinct_vertices(&close_ring(&square())), 4);
        let pt = LatLng::new(3.0, 3.0);
        assert_eq!(distinct_vertices(&[pt, pt, pt]), 1);
        assert_eq!(distinct_vertices(&[]), 0);
    }
}
