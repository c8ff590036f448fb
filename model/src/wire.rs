use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{close_ring, Geofence, GeofenceShape, GeofenceStatus, LatLng, ShapeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireShapeType {
    Polygon,
    Circle,
}

/// What the geofence persistence API exchanges for create, get, and update. Polygons travel as WKT
/// text and leave the circle fields empty; circles do the opposite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WirePayload {
    pub geofence_name: String,
    pub shape_type: WireShapeType,
    pub polygon: Option<String>,
    pub center_lat: Option<f64>,
    pub center_lng: Option<f64>,
    pub radius_meters: Option<f64>,
    #[serde(default)]
    pub account_ids: Vec<i64>,
    pub status: GeofenceStatus,
}

impl WirePayload {
    /// Formats the geometry as-is; validation happens before this.
    pub fn from_geofence(geofence: &Geofence) -> Self {
        let mut payload = Self {
            geofence_name: geofence.name.clone(),
            shape_type: WireShapeType::Polygon,
            polygon: None,
            center_lat: None,
            center_lng: None,
            radius_meters: None,
            account_ids: geofence.account_ids.clone(),
            status: geofence.status,
        };
        match geofence.shape {
            GeofenceShape::Polygon { ref ring } => {
                payload.polygon = Some(to_wkt_polygon(ring));
            }
            GeofenceShape::Circle {
                center,
                radius_meters,
            } => {
                payload.shape_type = WireShapeType::Circle;
                payload.center_lat = Some(center.lat);
                payload.center_lng = Some(center.lng);
                payload.radius_meters = Some(radius_meters);
            }
        }
        payload
    }

    pub fn to_geofence(&self, id: ShapeId) -> Result<Geofence> {
        let shape = match self.shape_type {
            WireShapeType::Polygon => match self.polygon {
                Some(ref wkt) => GeofenceShape::Polygon {
                    ring: parse_wkt_polygon(wkt)?,
                },
                None => bail!("Polygon geofence {id} has no polygon text"),
            },
            WireShapeType::Circle => {
                match (self.center_lat, self.center_lng, self.radius_meters) {
                    (Some(lat), Some(lng), Some(radius_meters)) => GeofenceShape::Circle {
                        center: LatLng::new(lat, lng),
                        radius_meters,
                    },
                    _ => bail!("Circle geofence {id} is missing its center or radius"),
                }
            }
        };
        Ok(Geofence {
            id,
            name: self.geofence_name.clone(),
            shape,
            status: self.status,
            account_ids: self.account_ids.clone(),
        })
    }
}

/// Produces "POLYGON((lng lat, lng lat, ...))", always as a closed ring.
pub fn to_wkt_polygon(ring: &[LatLng]) -> String {
    let coords: Vec<String> = close_ring(ring)
        .into_iter()
        .map(|pt| format!("{} {}", pt.lng, pt.lat))
        .collect();
    format!("POLYGON(({}))", coords.join(", "))
}

/// Reads the outer ring of a WKT polygon. Holes are ignored; geofences never have them.
pub fn parse_wkt_polygon(raw: &str) -> Result<Vec<LatLng>> {
    let trimmed = raw.trim();
    let body = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("POLYGON") => trimmed[7..].trim(),
        _ => bail!("Not a WKT polygon: {raw}"),
    };
    let inner = body
        .strip_prefix('(')
        .and_then(|x| x.strip_suffix(')'))
        .ok_or_else(|| anyhow!("Unbalanced parentheses in {raw}"))?
        .trim();
    let outer = inner
        .strip_prefix('(')
        .ok_or_else(|| anyhow!("Missing ring in {raw}"))?;
    let outer = match outer.find(')') {
        Some(idx) => {
            if !outer[idx + 1..].trim().is_empty() {
                warn!("Ignoring interior rings of WKT polygon");
            }
            &outer[..idx]
        }
        None => bail!("Unterminated ring in {raw}"),
    };

    let mut ring = Vec::new();
    for pair in outer.split(',') {
        let nums: Vec<&str> = pair.split_whitespace().collect();
        if nums.len() != 2 {
            bail!("Bad WKT coordinate {:?}", pair.trim());
        }
        let lng: f64 = nums[0].parse()?;
        let lat: f64 = nums[1].parse()?;
        ring.push(LatLng::new(lat, lng));
    }
    Ok(ring)
}
