#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

mod animation;
mod cluster;
mod config;
mod containment;
mod error;
mod routing;
mod shape_sync;

pub use animation::{AnimationState, Phase, PositionSink, PositionUpdate, RouteAnimationScheduler};
pub use cluster::{abbreviate_count, to_geojson, ClusterIndex, ClusterNode, ClusterSummary};
pub use config::{AnimationConfig, ClusterOptions, EngineConfig};
pub use containment::{
    evaluate, is_inside_circle, is_inside_polygon, shape_contains, AlertEvent, AlertPolicy,
    AlertTracker, GeofenceContainmentEvaluator, TrackingSession,
};
pub use error::{EngineError, Result};
pub use routing::{
    AddressLabels, Geocoder, RequestGate, RouteCandidate, RouteProvider, RouteRequest, RouteStep,
    Ticket, TravelMode,
};
pub use shape_sync::{
    fetch_geofence, on_shape_mutated, to_wire_format, toggle_status, validate, DrawnShape,
    EditSession, EditableOverlay, GeofenceApi, InMemoryGeofenceApi, MapShape, ShapeMutation,
};
