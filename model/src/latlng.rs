use std::fmt;

use geo::{Bearing, Destination, Distance as _, Haversine, Point};
use geom::{Distance, LonLat};
use serde::{Deserialize, Serialize};

/// The mean earth radius the haversine calculations use
pub const EARTH_RADIUS_METERS: f64 = geo::MEAN_EARTH_RADIUS;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }

    pub fn to_lonlat(self) -> LonLat {
        LonLat::new(self.lng, self.lat)
    }

    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lng, self.lat)
    }

    pub fn from_point(pt: Point<f64>) -> Self {
        Self::new(pt.y(), pt.x())
    }

    /// Great-circle (haversine) distance
    pub fn dist(self, other: LatLng) -> Distance {
        Distance::meters(self.dist_meters(other))
    }

    pub fn dist_meters(self, other: LatLng) -> f64 {
        Haversine::distance(self.to_point(), other.to_point())
    }

    /// The initial compass bearing of the great circle from `self` to `other`, in [0, 360). North
    /// is 0, east is 90. Identical points have a bearing of 0.
    pub fn bearing_to(self, other: LatLng) -> f64 {
        if self == other {
            return 0.0;
        }
        let bearing = Haversine::bearing(self.to_point(), other.to_point());
        (bearing % 360.0 + 360.0) % 360.0
    }

    /// Moves `meters` along a great circle with the given bearing.
    pub fn destination(self, bearing_degrees: f64, meters: f64) -> LatLng {
        let pt = Haversine::destination(self.to_point(), bearing_degrees, meters);
        LatLng::new(pt.y(), normalize_lng(pt.x()))
    }
}

impl fmt::Display for LatLng {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

fn normalize_lng(lng: f64) -> f64 {
    ((lng + 540.0) % 360.0) - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearing_cardinal_directions() {
        let origin = LatLng::new(0.0, 0.0);
        assert!((origin.bearing_to(LatLng::new(1.0, 0.0)) - 0.0).abs() < 1e-9);
        assert!((origin.bearing_to(LatLng::new(0.0, 1.0)) - 90.0).abs() < 1e-9);
        assert!((origin.bearing_to(LatLng::new(-1.0, 0.0)) - 180.0).abs() < 1e-9);
        assert!((origin.bearing_to(LatLng::new(0.0, -1.0)) - 270.0).abs() < 1e-9);
        assert_eq!(origin.bearing_to(origin), 0.0);
    }

    #[test]
    fn destination_matches_distance() {
        let origin = LatLng::new(47.6, -122.3);
        let moved = origin.destination(45.0, 1500.0);
        assert!((origin.dist_meters(moved) - 1500.0).abs() < 1.0);
        assert!((origin.bearing_to(moved) - 45.0).abs() < 0.1);
    }

    #[test]
    fn one_degree_of_latitude() {
        let meters = LatLng::new(0.0, 0.0).dist_meters(LatLng::new(1.0, 0.0));
        assert!((meters - 111_195.0).abs() < 1.0);
        let pt = LatLng::new(47.6, -122.3);
        assert_eq!(LatLng::from_point(pt.to_point()), pt);
    }

    #[test]
    fn non_finite() {
        assert!(!LatLng::new(f64::NAN, 0.0).is_finite());
        assert!(!LatLng::new(0.0, f64::INFINITY).is_finite());
        assert!(LatLng::new(10.0, 20.0).is_finite());
    }
}
