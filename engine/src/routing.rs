//! Boundaries to the external directions and geocoding services. Both are slow, cancellable
//! lookups whose results can arrive after a newer request for the same asset has started; those
//! late results are thrown away.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use model::{AssetId, LatLng, RoutePolyline};

use crate::{EngineError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    #[default]
    Driving,
    Walking,
    Bicycling,
    Transit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub origin: LatLng,
    pub destination: LatLng,
    #[serde(default)]
    pub travel_mode: TravelMode,
    #[serde(default)]
    pub traffic_aware: bool,
    #[serde(default)]
    pub avoid_tolls: bool,
    #[serde(default)]
    pub avoid_highways: bool,
    #[serde(default)]
    pub avoid_ferries: bool,
    #[serde(default)]
    pub departure_time: Option<DateTime<Utc>>,
}

impl RouteRequest {
    pub fn driving(origin: LatLng, destination: LatLng) -> Self {
        Self {
            origin,
            destination,
            travel_mode: TravelMode::Driving,
            traffic_aware: false,
            avoid_tolls: false,
            avoid_highways: false,
            avoid_ferries: false,
            departure_time: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub encoded_polyline: String,
    #[serde(default)]
    pub distance_meters: Option<f64>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteCandidate {
    #[serde(default)]
    pub summary: String,
    pub steps: Vec<RouteStep>,
}

impl RouteCandidate {
    pub fn to_polyline(&self) -> anyhow::Result<RoutePolyline> {
        RoutePolyline::from_encoded_steps(self.steps.iter().map(|s| &s.encoded_polyline))
    }
}

/// A directions service. Only the first candidate returned is used.
pub trait RouteProvider: Send + Sync {
    fn directions(
        &self,
        request: &RouteRequest,
    ) -> impl Future<Output = anyhow::Result<Vec<RouteCandidate>>> + Send;
}

/// Turns a position into a human-readable place name.
pub trait Geocoder: Send + Sync {
    fn reverse_geocode(&self, pos: LatLng) -> impl Future<Output = anyhow::Result<String>> + Send;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub asset: AssetId,
    pub request: u64,
}

/// Tracks the newest outstanding request per asset. Starting a request supersedes everything
/// before it for the same asset.
#[derive(Default)]
pub struct RequestGate {
    counter: AtomicU64,
    latest: Mutex<BTreeMap<AssetId, u64>>,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, asset: &AssetId) -> Ticket {
        let request = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.with_latest(|latest| {
            latest.insert(asset.clone(), request);
        });
        Ticket {
            asset: asset.clone(),
            request,
        }
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        self.with_latest(|latest| latest.get(&ticket.asset) == Some(&ticket.request))
    }

    /// Fails with `StaleResult` if something newer started (or the asset was cancelled) since
    /// the ticket was issued.
    pub fn check(&self, ticket: &Ticket) -> Result<()> {
        if self.is_current(ticket) {
            Ok(())
        } else {
            debug!(
                "Discarding result of request {} for {}",
                ticket.request, ticket.asset
            );
            Err(EngineError::StaleResult {
                asset: ticket.asset.clone(),
                request: ticket.request,
            })
        }
    }

    /// Invalidates any outstanding request for the asset.
    pub fn cancel(&self, asset: &AssetId) {
        self.with_latest(|latest| {
            latest.remove(asset);
        });
    }

    fn with_latest<T, F: FnOnce(&mut BTreeMap<AssetId, u64>) -> T>(&self, f: F) -> T {
        match self.latest.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(err) => f(&mut err.into_inner()),
        }
    }
}

/// Place names for asset markers, looked up as assets move. A failed lookup just leaves the asset
/// without a label.
#[derive(Default)]
pub struct AddressLabels {
    gate: RequestGate,
    labels: Mutex<BTreeMap<AssetId, String>>,
}

impl AddressLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh<G: Geocoder>(
        &self,
        geocoder: &G,
        asset: &AssetId,
        pos: LatLng,
    ) -> Result<String> {
        if !pos.is_finite() {
            return Err(EngineError::InvalidGeometry(format!(
                "can't geocode {asset} at {pos}"
            )));
        }
        let ticket = self.gate.begin(asset);
        let label = geocoder.reverse_geocode(pos).await.map_err(|err| {
            warn!("Geocoding {asset} at {pos} failed: {err}");
            EngineError::ExternalService(err.to_string())
        })?;
        // Checking and storing under one lock, so a newer label can't be overwritten in between
        let mut labels = self.lock_labels();
        self.gate.check(&ticket)?;
        labels.insert(asset.clone(), label.clone());
        Ok(label)
    }

    pub fn get(&self, asset: &AssetId) -> Option<String> {
        self.lock_labels().get(asset).cloned()
    }

    fn lock_labels(&self) -> MutexGuard<BTreeMap<AssetId, String>> {
        match self.labels.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }
}
