//! Keeps a geofence draft in sync with the shape a user is editing on the map, and pushes the
//! result to the geofence persistence service.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use model::{
    close_ring, distinct_vertices, Geofence, GeofenceShape, GeofenceStatus, LatLng, ShapeId,
    ShapeType, WirePayload,
};

use crate::{EngineError, Result};

/// A shape drawn by the host map SDK.
pub trait MapShape {
    /// The polygon's vertices in drawing order, closed or not.
    fn vertices(&self) -> Vec<LatLng>;
    fn center(&self) -> LatLng;
    fn radius_meters(&self) -> f64;
}

/// A shape the user can drag around. The host applies user edits and fires a callback after each
/// one, until the listeners are cleared.
pub trait EditableOverlay: MapShape {
    fn apply(&mut self, mutation: &ShapeMutation);
    fn clear_mutation_listeners(&mut self);
}

#[derive(Clone, Debug, PartialEq)]
pub enum ShapeMutation {
    InsertVertex { index: usize, pos: LatLng },
    RemoveVertex { index: usize },
    MoveVertex { index: usize, pos: LatLng },
    MoveCenter(LatLng),
    Resize { radius_meters: f64 },
}

/// Reads the live geometry. Polygon rings always come out closed.
pub fn on_shape_mutated<S: MapShape + ?Sized>(shape: &S, shape_type: ShapeType) -> GeofenceShape {
    match shape_type {
        ShapeType::Polygon => GeofenceShape::Polygon {
            ring: close_ring(&shape.vertices()),
        },
        ShapeType::Circle => GeofenceShape::Circle {
            center: shape.center(),
            radius_meters: shape.radius_meters(),
        },
    }
}

pub fn validate(shape: &GeofenceShape) -> Result<()> {
    match shape {
        GeofenceShape::Polygon { ring } => {
            if ring.iter().any(|pt| !pt.is_finite()) {
                return Err(EngineError::InvalidGeometry(
                    "polygon has non-finite vertices".to_string(),
                ));
            }
            let n = distinct_vertices(ring);
            if n < 3 {
                return Err(EngineError::InvalidGeometry(format!(
                    "polygon needs at least 3 distinct vertices, but has {n}"
                )));
            }
        }
        GeofenceShape::Circle {
            center,
            radius_meters,
        } => {
            if !center.is_finite() {
                return Err(EngineError::InvalidGeometry(format!(
                    "circle center {center} isn't finite"
                )));
            }
            if !(radius_meters.is_finite() && *radius_meters > 0.0) {
                return Err(EngineError::InvalidGeometry(format!(
                    "circle radius {radius_meters} must be positive"
                )));
            }
        }
    }
    Ok(())
}

/// Checks the geometry, then formats it for the persistence service.
pub fn to_wire_format(geofence: &Geofence) -> Result<WirePayload> {
    validate(&geofence.shape)?;
    Ok(WirePayload::from_geofence(geofence))
}

/// The geofence persistence service.
pub trait GeofenceApi: Send + Sync {
    fn create(&self, payload: &WirePayload)
        -> impl Future<Output = anyhow::Result<ShapeId>> + Send;
    fn get(&self, id: &ShapeId) -> impl Future<Output = anyhow::Result<WirePayload>> + Send;
    fn update(
        &self,
        id: &ShapeId,
        payload: &WirePayload,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
    /// Returns the new status
    fn toggle_status(
        &self,
        id: &ShapeId,
    ) -> impl Future<Output = anyhow::Result<GeofenceStatus>> + Send;
}

/// Fetches the server's copy of a geofence.
pub async fn fetch_geofence<A: GeofenceApi>(api: &A, id: &ShapeId) -> Result<Geofence> {
    let payload = api
        .get(id)
        .await
        .map_err(|err| EngineError::ExternalService(err.to_string()))?;
    payload
        .to_geofence(id.clone())
        .map_err(|err| EngineError::InvalidGeometry(err.to_string()))
}

pub async fn toggle_status<A: GeofenceApi>(api: &A, id: &ShapeId) -> Result<GeofenceStatus> {
    let status = api.toggle_status(id).await.map_err(|err| {
        warn!("Couldn't toggle geofence {id}: {err}");
        EngineError::ExternalService(err.to_string())
    })?;
    info!("Geofence {id} is now {status:?}");
    Ok(status)
}

/// One round of editing a geofence, from entering edit mode until save or cancel.
pub struct EditSession<O: EditableOverlay> {
    // None until the first save creates it
    id: Option<ShapeId>,
    name: String,
    status: GeofenceStatus,
    account_ids: Vec<i64>,
    shape_type: ShapeType,
    draft: GeofenceShape,
    overlay: O,
    attached: bool,
}

impl<O: EditableOverlay> EditSession<O> {
    /// Starts editing a geofence that already exists. The overlay should be drawing it.
    pub fn edit(geofence: Geofence, overlay: O) -> Self {
        let shape_type = geofence.shape.shape_type();
        let draft = on_shape_mutated(&overlay, shape_type);
        Self {
            id: Some(geofence.id),
            name: geofence.name,
            status: geofence.status,
            account_ids: geofence.account_ids,
            shape_type,
            draft,
            overlay,
            attached: true,
        }
    }

    /// Starts drawing a new geofence.
    pub fn create(name: String, shape_type: ShapeType, account_ids: Vec<i64>, overlay: O) -> Self {
        let draft = on_shape_mutated(&overlay, shape_type);
        Self {
            id: None,
            name,
            status: GeofenceStatus::Active,
            account_ids,
            shape_type,
            draft,
            overlay,
            attached: true,
        }
    }

    pub fn draft(&self) -> &GeofenceShape {
        &self.draft
    }

    pub fn overlay(&self) -> &O {
        &self.overlay
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn rename(&mut self, name: String) {
        self.name = name;
    }

    /// Applies a user edit to the overlay and refreshes the draft from what's now drawn.
    pub fn handle_mutation(&mut self, mutation: ShapeMutation) -> Result<&GeofenceShape> {
        if !self.attached {
            return Err(EngineError::Detached(self.name.clone()));
        }
        self.overlay.apply(&mutation);
        self.draft = on_shape_mutated(&self.overlay, self.shape_type);
        Ok(&self.draft)
    }

    /// Discards the draft. The server copy is untouched.
    pub fn cancel(&mut self) {
        if self.attached {
            debug!("Discarding edits to geofence {}", self.name);
        }
        self.detach();
    }

    /// Validates and submits the draft, then returns what the server now has. Invalid geometry is
    /// rejected before anything is sent, and the session stays open so the user can fix it.
    pub async fn save<A: GeofenceApi>(&mut self, api: &A) -> Result<Geofence> {
        if !self.attached {
            return Err(EngineError::Detached(self.name.clone()));
        }
        let payload = to_wire_format(&self.draft_geofence())?;
        let id = match self.id {
            Some(ref id) => {
                api.update(id, &payload)
                    .await
                    .map_err(|err| EngineError::ExternalService(err.to_string()))?;
                id.clone()
            }
            None => {
                let id = api
                    .create(&payload)
                    .await
                    .map_err(|err| EngineError::ExternalService(err.to_string()))?;
                info!("Created geofence {} as {id}", self.name);
                self.id = Some(id.clone());
                id
            }
        };
        let saved = fetch_geofence(api, &id).await?;
        self.detach();
        Ok(saved)
    }

    fn draft_geofence(&self) -> Geofence {
        Geofence {
            id: self.id.clone().unwrap_or_else(|| ShapeId::new("")),
            name: self.name.clone(),
            shape: self.draft.clone(),
            status: self.status,
            account_ids: self.account_ids.clone(),
        }
    }

    fn detach(&mut self) {
        if self.attached {
            self.overlay.clear_mutation_listeners();
            self.attached = false;
        }
    }
}

/// An editable shape that isn't backed by any map widget. Handy for replaying recorded edits.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawnShape {
    pub vertices: Vec<LatLng>,
    pub center: LatLng,
    pub radius_meters: f64,
    pub listening: bool,
}

impl DrawnShape {
    pub fn polygon(vertices: Vec<LatLng>) -> Self {
        let center = centroid(&vertices);
        Self {
            vertices,
            center,
            radius_meters: 0.0,
            listening: true,
        }
    }

    pub fn circle(center: LatLng, radius_meters: f64) -> Self {
        Self {
            vertices: Vec::new(),
            center,
            radius_meters,
            listening: true,
        }
    }

    pub fn from_shape(shape: &GeofenceShape) -> Self {
        match shape {
            GeofenceShape::Polygon { ring } => {
                // The closing vertex isn't something the user can drag separately
                let mut vertices = ring.clone();
                if vertices.len() > 1 && vertices.first() == vertices.last() {
                    vertices.pop();
                }
                Self::polygon(vertices)
            }
            GeofenceShape::Circle {
                center,
                radius_meters,
            } => Self::circle(*center, *radius_meters),
        }
    }
}

impl MapShape for DrawnShape {
    fn vertices(&self) -> Vec<LatLng> {
        self.vertices.clone()
    }

    fn center(&self) -> LatLng {
        self.center
    }

    fn radius_meters(&self) -> f64 {
        self.radius_meters
    }
}

impl EditableOverlay for DrawnShape {
    fn apply(&mut self, mutation: &ShapeMutation) {
        match *mutation {
            ShapeMutation::InsertVertex { index, pos } => {
                let index = index.min(self.vertices.len());
                self.vertices.insert(index, pos);
            }
            ShapeMutation::RemoveVertex { index } => {
                if index < self.vertices.len() {
                    self.vertices.remove(index);
                } else {
                    warn!("Can't remove vertex {index}; there are only {}", self.vertices.len());
                }
            }
            ShapeMutation::MoveVertex { index, pos } => match self.vertices.get_mut(index) {
                Some(pt) => {
                    *pt = pos;
                }
                None => {
                    warn!("Can't move vertex {index}; there are only {}", self.vertices.len());
                }
            },
            ShapeMutation::MoveCenter(pos) => {
                if self.vertices.is_empty() {
                    self.center = pos;
                } else {
                    // Dragging a polygon drags every vertex
                    let dlat = pos.lat - self.center.lat;
                    let dlng = pos.lng - self.center.lng;
                    for pt in &mut self.vertices {
                        pt.lat += dlat;
                        pt.lng += dlng;
                    }
                    self.center = pos;
                }
            }
            ShapeMutation::Resize { radius_meters } => {
                self.radius_meters = radius_meters;
            }
        }
    }

    fn clear_mutation_listeners(&mut self) {
        self.listening = false;
    }
}

fn centroid(pts: &[LatLng]) -> LatLng {
    if pts.is_empty() {
        return LatLng::new(0.0, 0.0);
    }
    let n = pts.len() as f64;
    LatLng::new(
        pts.iter().map(|pt| pt.lat).sum::<f64>() / n,
        pts.iter().map(|pt| pt.lng).sum::<f64>() / n,
    )
}

/// Keeps geofences in memory, in place of a real persistence service.
#[derive(Default)]
pub struct InMemoryGeofenceApi {
    next_id: AtomicU64,
    geofences: Mutex<BTreeMap<ShapeId, WirePayload>>,
}

impl InMemoryGeofenceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.geofences.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_geofences<T, F: FnOnce(&mut BTreeMap<ShapeId, WirePayload>) -> T>(&self, f: F) -> T {
        match self.geofences.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(err) => f(&mut err.into_inner()),
        }
    }
}

impl GeofenceApi for InMemoryGeofenceApi {
    fn create(
        &self,
        payload: &WirePayload,
    ) -> impl Future<Output = anyhow::Result<ShapeId>> + Send {
        let id = ShapeId::new(format!(
            "geofence-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        ));
        self.with_geofences(|geofences| {
            geofences.insert(id.clone(), payload.clone());
        });
        async move { Ok(id) }
    }

    fn get(&self, id: &ShapeId) -> impl Future<Output = anyhow::Result<WirePayload>> + Send {
        let result = self
            .with_geofences(|geofences| geofences.get(id).cloned())
            .ok_or_else(|| anyhow!("No geofence {id}"));
        async move { result }
    }

    fn update(
        &self,
        id: &ShapeId,
        payload: &WirePayload,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        let result = self.with_geofences(|geofences| match geofences.get_mut(id) {
            Some(existing) => {
                *existing = payload.clone();
                Ok(())
            }
            None => Err(anyhow!("No geofence {id}")),
        });
        async move { result }
    }

    fn toggle_status(
        &self,
        id: &ShapeId,
    ) -> impl Future<Output = anyhow::Result<GeofenceStatus>> + Send {
        let result = self.with_geofences(|geofences| match geofences.get_mut(id) {
            Some(existing) => {
                existing.status = existing.status.toggled();
                Ok(existing.status)
            }
            None => Err(anyhow!("No geofence {id}")),
        });
        async move { result }
    }
}
