use std::fmt;

use serde::{Deserialize, Serialize};

/// The external data source's identifier for a truck or piece of equipment. Also used to key
/// animation and alert tracking.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShapeId(pub String);

impl AssetId {
    pub fn new<S: Into<String>>(x: S) -> Self {
        Self(x.into())
    }
}

impl ShapeId {
    pub fn new<S: Into<String>>(x: S) -> Self {
        Self(x.into())
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
