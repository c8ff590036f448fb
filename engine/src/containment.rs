use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use geom::Distance;
use serde::{Deserialize, Serialize};

use model::{distinct_vertices, AssetId, Geofence, GeofenceShape, LatLng, ShapeId};

use crate::animation::{PositionSink, PositionUpdate};
use crate::shape_sync::validate;

/// What happens after a truck has been alerted for a geofence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPolicy {
    /// Never alert again for the same truck and geofence until the tracking session restarts.
    #[default]
    OncePerSession,
    /// Leaving the geofence forgets the alert, so the next entry alerts again.
    RearmOnExit,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertEvent {
    pub truck: AssetId,
    pub shape_id: ShapeId,
    pub geofence_name: String,
    pub position: LatLng,
}

/// Distance from the center is measured along the great circle. A point exactly on the boundary
/// counts as inside.
pub fn is_inside_circle(point: LatLng, center: LatLng, radius: Distance) -> bool {
    point.is_finite() && center.is_finite() && point.dist(center) <= radius
}

/// Even-odd ray casting in lng/lat space. The ring can wind either way and doesn't have to repeat
/// its first vertex. Degenerate rings contain nothing.
pub fn is_inside_polygon(point: LatLng, ring: &[LatLng]) -> bool {
    if !point.is_finite() || distinct_vertices(ring) < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        if (a.lat > point.lat) != (b.lat > point.lat)
            && point.lng < (b.lng - a.lng) * (point.lat - a.lat) / (b.lat - a.lat) + a.lng
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub fn shape_contains(shape: &GeofenceShape, point: LatLng) -> bool {
    match shape {
        GeofenceShape::Circle {
            center,
            radius_meters,
        } => {
            radius_meters.is_finite()
                && *radius_meters >= 0.0
                && is_inside_circle(point, *center, Distance::meters(*radius_meters))
        }
        GeofenceShape::Polygon { ring } => is_inside_polygon(point, ring),
    }
}

/// Which geofences each truck has already been alerted for. Each `(truck, geofence)` pair appears
/// at most once.
#[derive(Clone, Debug, Default)]
pub struct AlertTracker {
    alerted: BTreeMap<AssetId, BTreeSet<ShapeId>>,
}

impl AlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, truck: &AssetId, shape: &ShapeId) -> bool {
        self.alerted
            .get(truck)
            .map(|shapes| shapes.contains(shape))
            .unwrap_or(false)
    }

    /// False if the pair was already recorded
    pub fn record(&mut self, truck: &AssetId, shape: &ShapeId) -> bool {
        self.alerted
            .entry(truck.clone())
            .or_insert_with(BTreeSet::new)
            .insert(shape.clone())
    }

    pub fn forget(&mut self, truck: &AssetId, shape: &ShapeId) {
        if let Some(shapes) = self.alerted.get_mut(truck) {
            shapes.remove(shape);
            if shapes.is_empty() {
                self.alerted.remove(truck);
            }
        }
    }

    pub fn alerted_for(&self, truck: &AssetId) -> Vec<ShapeId> {
        self.alerted
            .get(truck)
            .map(|shapes| shapes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.alerted.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.alerted.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GeofenceContainmentEvaluator {
    pub policy: AlertPolicy,
}

impl GeofenceContainmentEvaluator {
    pub fn new(policy: AlertPolicy) -> Self {
        Self { policy }
    }

    /// Checks one position against the geofences, in order. The first active geofence containing
    /// the point that hasn't alerted for this truck yet produces the event; any others the point is
    /// also inside are left for a later tick. At most one event per call.
    pub fn evaluate(
        &self,
        truck: &AssetId,
        point: LatLng,
        shapes: &[Geofence],
        tracker: &mut AlertTracker,
    ) -> Option<AlertEvent> {
        if !point.is_finite() {
            return None;
        }

        if self.policy == AlertPolicy::RearmOnExit {
            for shape_id in tracker.alerted_for(truck) {
                if let Some(geofence) = shapes.iter().find(|g| g.id == shape_id) {
                    if !shape_contains(&geofence.shape, point) {
                        debug!("{truck} left {}; it can alert again", geofence.name);
                        tracker.forget(truck, &shape_id);
                    }
                }
            }
        }

        for geofence in shapes {
            if !geofence.is_active() || tracker.contains(truck, &geofence.id) {
                continue;
            }
            if shape_contains(&geofence.shape, point) {
                tracker.record(truck, &geofence.id);
                return Some(AlertEvent {
                    truck: truck.clone(),
                    shape_id: geofence.id.clone(),
                    geofence_name: geofence.name.clone(),
                    position: point,
                });
            }
        }
        None
    }
}

/// `evaluate` with the default once-per-session policy
pub fn evaluate(
    truck: &AssetId,
    point: LatLng,
    shapes: &[Geofence],
    tracker: &mut AlertTracker,
) -> Option<AlertEvent> {
    GeofenceContainmentEvaluator::default().evaluate(truck, point, shapes, tracker)
}

/// One live-tracking session: the geofences being watched and who has already been alerted.
/// Subscribe it to the animation scheduler to check every new position. Alerts are also sent to
/// the receiver returned at creation.
pub struct TrackingSession {
    evaluator: GeofenceContainmentEvaluator,
    geofences: RwLock<Arc<Vec<Geofence>>>,
    tracker: Mutex<AlertTracker>,
    alerts: UnboundedSender<AlertEvent>,
}

impl TrackingSession {
    pub fn new(
        policy: AlertPolicy,
        geofences: Vec<Geofence>,
    ) -> (Arc<TrackingSession>, UnboundedReceiver<AlertEvent>) {
        Self::with_shared_geofences(policy, Arc::new(usable_geofences(geofences)))
    }

    fn with_shared_geofences(
        policy: AlertPolicy,
        geofences: Arc<Vec<Geofence>>,
    ) -> (Arc<TrackingSession>, UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = unbounded();
        let session = TrackingSession {
            evaluator: GeofenceContainmentEvaluator::new(policy),
            geofences: RwLock::new(geofences),
            tracker: Mutex::new(AlertTracker::new()),
            alerts: tx,
        };
        (Arc::new(session), rx)
    }

    /// Starts over with nobody alerted, watching the same geofences. This session should be
    /// dropped (and unsubscribed) afterwards.
    pub fn restart(&self) -> (Arc<TrackingSession>, UnboundedReceiver<AlertEvent>) {
        Self::with_shared_geofences(self.evaluator.policy, self.geofences())
    }

    /// Swaps in a new list, such as after a geofence was saved or toggled. Alerts already raised
    /// stay raised.
    pub fn set_geofences(&self, geofences: Vec<Geofence>) {
        match self.geofences.write() {
            Ok(mut guard) => *guard = Arc::new(usable_geofences(geofences)),
            Err(err) => error!("Geofence list lock poisoned: {err}"),
        }
    }

    pub fn geofences(&self) -> Arc<Vec<Geofence>> {
        match self.geofences.read() {
            Ok(guard) => guard.clone(),
            Err(err) => err.into_inner().clone(),
        }
    }

    pub fn observe(&self, truck: &AssetId, point: LatLng) -> Option<AlertEvent> {
        let geofences = self.geofences();
        let event = {
            let mut tracker = match self.tracker.lock() {
                Ok(guard) => guard,
                Err(err) => err.into_inner(),
            };
            self.evaluator.evaluate(truck, point, &geofences, &mut tracker)?
        };

        info!("{} entered geofence {}", event.truck, event.geofence_name);
        if self.alerts.unbounded_send(event.clone()).is_err() {
            debug!("Nobody is listening for alerts anymore");
        }
        Some(event)
    }

    pub fn alerted_for(&self, truck: &AssetId) -> Vec<ShapeId> {
        match self.tracker.lock() {
            Ok(guard) => guard.alerted_for(truck),
            Err(err) => err.into_inner().alerted_for(truck),
        }
    }
}

// Geofences with broken geometry can't contain anything, so they're not watched at all
fn usable_geofences(geofences: Vec<Geofence>) -> Vec<Geofence> {
    geofences
        .into_iter()
        .filter(|geofence| match validate(&geofence.shape) {
            Ok(()) => true,
            Err(err) => {
                warn!("Not watching geofence {} ({}): {err}", geofence.id, geofence.name);
                false
            }
        })
        .collect()
}

impl PositionSink for TrackingSession {
    fn on_position(&self, update: &PositionUpdate) {
        self.observe(&update.asset, update.position);
    }
}
