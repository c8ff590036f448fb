use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::LatLng;

/// The vertices of one computed route, produced once per route request and never modified
/// afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutePolyline {
    points: Vec<LatLng>,
}

impl RoutePolyline {
    pub fn new(points: Vec<LatLng>) -> Self {
        Self { points }
    }

    /// Glues together the encoded polylines of consecutive route steps. Each step usually starts
    /// where the previous ended, so that shared vertex is only kept once.
    pub fn from_encoded_steps<I: IntoIterator<Item = S>, S: AsRef<str>>(steps: I) -> Result<Self> {
        let mut points: Vec<LatLng> = Vec::new();
        for step in steps {
            let decoded = decode_polyline(step.as_ref())?;
            let skip = match (points.last(), decoded.first()) {
                (Some(last), Some(first)) if last == first => 1,
                _ => 0,
            };
            points.extend(decoded.into_iter().skip(skip));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[LatLng] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Drops non-finite vertices, returning how many were removed.
    pub fn retain_finite(&mut self) -> usize {
        let before = self.points.len();
        self.points.retain(|pt| pt.is_finite());
        before - self.points.len()
    }

    pub fn length_meters(&self) -> f64 {
        self.points
            .windows(2)
            .map(|pair| pair[0].dist_meters(pair[1]))
            .sum()
    }
}

/// Decodes the encoded polyline format used by directions services (5 decimal digits of
/// precision, zigzag varints in base64-ish chunks offset by 63).
pub fn decode_polyline(encoded: &str) -> Result<Vec<LatLng>> {
    let bytes = encoded.as_bytes();
    let mut idx = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;
    let mut points = Vec::new();

    while idx < bytes.len() {
        lat = match lat.checked_add(next_delta(bytes, &mut idx)?) {
            Some(x) => x,
            None => bail!("Encoded polyline latitude overflows at byte {idx}"),
        };
        if idx >= bytes.len() {
            bail!("Encoded polyline ends after a latitude at byte {idx}");
        }
        lng = match lng.checked_add(next_delta(bytes, &mut idx)?) {
            Some(x) => x,
            None => bail!("Encoded polyline longitude overflows at byte {idx}"),
        };
        points.push(LatLng::new(lat as f64 / 1e5, lng as f64 / 1e5));
    }
    Ok(points)
}

fn next_delta(bytes: &[u8], idx: &mut usize) -> Result<i64> {
    let mut result: i64 = 0;
    let mut shift = 0;
    loop {
        let byte = match bytes.get(*idx) {
            Some(b) => *b,
            None => bail!("Encoded polyline truncated at byte {}", *idx),
        };
        if !(63..=126).contains(&byte) {
            bail!("Invalid byte {byte} in encoded polyline at {}", *idx);
        }
        *idx += 1;
        let chunk = (byte - 63) as i64;
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
        if shift > 60 {
            bail!("Encoded polyline value too long at byte {}", *idx);
        }
    }
    Ok(if result & 1 != 0 {
        !(result >> 1)
    } else {
        result >> 1
    })
}
