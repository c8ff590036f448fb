use model::AssetId;
use thiserror::Error;

/// Failures in this crate only ever affect one asset or one geofence. None of them stop the rest
/// of the fleet from clustering, animating, or being monitored.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("result of request {request} for {asset} was superseded")]
    StaleResult { asset: AssetId, request: u64 },
    #[error("external service failed: {0}")]
    ExternalService(String),
    #[error("no cluster with ID {0}")]
    UnknownCluster(usize),
    #[error("the edit session for geofence {0:?} is no longer attached")]
    Detached(String),
    #[error("{0} isn't being animated")]
    UnknownAsset(AssetId),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
