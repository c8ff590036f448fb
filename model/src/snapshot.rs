use abstutil::{prettyprint_usize, Timer};
use anyhow::Result;
use chrono::NaiveDateTime;
use geom::GPSBounds;
use serde::Deserialize;

use crate::{AssetId, AssetPoint, AssetStatus};

/// One refresh of fleet positions from the external data source. Assets with unusable
/// coordinates are dropped while loading; the rest of the snapshot is still usable.
pub struct FleetSnapshot {
    pub assets: Vec<AssetPoint>,
    pub gps_bounds: GPSBounds,
    /// How many input records were dropped for having invalid coordinates
    pub skipped: usize,
}

impl FleetSnapshot {
    pub fn new(raw: Vec<AssetPoint>) -> Self {
        let mut assets = Vec::new();
        let mut gps_bounds = GPSBounds::new();
        let mut skipped = 0;
        for asset in raw {
            if !asset.has_valid_position() {
                debug!(
                    "Skipping {} with invalid position {}, {}",
                    asset.id, asset.lat, asset.lng
                );
                skipped += 1;
                continue;
            }
            gps_bounds.update(asset.pos().to_lonlat());
            assets.push(asset);
        }
        if skipped > 0 {
            warn!(
                "Fleet snapshot had {} assets with invalid positions; keeping {}",
                prettyprint_usize(skipped),
                prettyprint_usize(assets.len())
            );
        }
        Self {
            assets,
            gps_bounds,
            skipped,
        }
    }

    pub fn get(&self, id: &AssetId) -> Option<&AssetPoint> {
        self.assets.iter().find(|a| &a.id == id)
    }
}

/// Reads the REST layer's JSON array of assets
pub fn load_snapshot_json<R: std::io::Read>(reader: R) -> Result<FleetSnapshot> {
    let raw: Vec<AssetPoint> = serde_json::from_reader(reader)?;
    Ok(FleetSnapshot::new(raw))
}

pub fn load_snapshot_csv<R: std::io::Read>(reader: R, timer: &mut Timer) -> Result<FleetSnapshot> {
    timer.start("load fleet snapshot");
    let mut raw = Vec::new();
    for rec in csv::Reader::from_reader(reader).deserialize() {
        let rec: Record = rec?;

        let reported_at = match rec.reported_at {
            Some(ref x) if !x.is_empty() => Some(
                NaiveDateTime::parse_from_str(x, "%Y-%m-%d %H:%M:%S")
                    .map_err(|err| anyhow!("{}: bad reported_at {x}: {err}", rec.id))?,
            ),
            _ => None,
        };
        let has_alert = rec.has_alert.unwrap_or(rec.status == AssetStatus::Alert);

        raw.push(AssetPoint {
            id: rec.id,
            name: rec.name.filter(|x| !x.is_empty()),
            lat: rec.lat.unwrap_or(f64::NAN),
            lng: rec.lng.unwrap_or(f64::NAN),
            status: rec.status,
            has_alert,
            reported_at,
        });
    }
    timer.stop("load fleet snapshot");
    Ok(FleetSnapshot::new(raw))
}

#[derive(Deserialize)]
struct Record {
    id: AssetId,
    name: Option<String>,
    // Missing or garbage coordinates become NaN and get filtered out, instead of failing the
    // whole snapshot
    #[serde(default, deserialize_with = "csv::invalid_option")]
    lat: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    lng: Option<f64>,
    status: AssetStatus,
    has_alert: Option<bool>,
    reported_at: Option<String>,
}
