#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

mod asset;
mod geofence;
mod ids;
mod latlng;
mod route;
mod snapshot;
mod wire;

use serde::{Deserialize, Serialize};

pub use self::asset::{AssetPoint, AssetStatus};
pub use self::geofence::{
    close_ring, distinct_vertices, Geofence, GeofenceShape, GeofenceStatus, ShapeType,
};
pub use self::ids::{AssetId, ShapeId};
pub use self::latlng::{LatLng, EARTH_RADIUS_METERS};
pub use self::route::{decode_polyline, RoutePolyline};
pub use self::snapshot::{load_snapshot_csv, load_snapshot_json, FleetSnapshot};
pub use self::wire::{parse_wkt_polygon, to_wkt_polygon, WirePayload, WireShapeType};

/// A viewport in degrees. `west > east` means the box crosses the antimeridian.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn world() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    /// Parses "west,south,east,north"
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let parts = raw
            .split(',')
            .map(|x| x.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()?;
        if parts.len() != 4 {
            bail!("A bbox needs 4 comma-separated numbers, got {raw}");
        }
        if parts.iter().any(|x| !x.is_finite()) {
            bail!("Non-finite bbox {raw}");
        }
        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }
}
