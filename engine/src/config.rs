use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::containment::AlertPolicy;

/// Everything tunable about the engine. Missing fields in a config file take the defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cluster: ClusterOptions,
    pub animation: AnimationConfig,
    pub alert_policy: AlertPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterOptions::default(),
            animation: AnimationConfig::default(),
            alert_policy: AlertPolicy::OncePerSession,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Groups need at least this many points to form a cluster
    pub min_points: usize,
    /// Cluster radius in pixels
    pub radius: f64,
    /// Tile extent in pixels; the radius is relative to this
    pub extent: f64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            min_zoom: 0,
            max_zoom: 16,
            min_points: 2,
            radius: 40.0,
            extent: 512.0,
        }
    }
}

impl ClusterOptions {
    /// Cluster IDs reserve 5 bits for the zoom, so zoom levels stop at 30.
    pub const MAX_SUPPORTED_ZOOM: u8 = 30;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_zoom > self.max_zoom {
            bail!(
                "min_zoom {} is bigger than max_zoom {}",
                self.min_zoom,
                self.max_zoom
            );
        }
        if self.max_zoom > Self::MAX_SUPPORTED_ZOOM {
            bail!("max_zoom {} is too high", self.max_zoom);
        }
        if !(self.radius > 0.0 && self.extent > 0.0) {
            bail!("radius and extent must be positive");
        }
        if self.min_points == 0 {
            bail!("min_points must be at least 1");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    pub tick_interval_ms: u64,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 60,
        }
    }
}

impl AnimationConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"cluster": {"radius": 60.0}, "alert_policy": "rearm_on_exit"}"#)
                .unwrap();
        assert_eq!(config.cluster.radius, 60.0);
        assert_eq!(config.cluster.max_zoom, 16);
        assert_eq!(config.animation.tick_interval(), Duration::from_millis(60));
        assert_eq!(config.alert_policy, AlertPolicy::RearmOnExit);
    }

    #[test]
    fn bad_cluster_options() {
        let mut opts = ClusterOptions::default();
        assert!(opts.validate().is_ok());
        opts.min_zoom = 17;
        assert!(opts.validate().is_err());
        opts.min_zoom = 0;
        opts.max_zoom = 31;
        assert!(opts.validate().is_err());
        opts.max_zoom = 16;
        opts.radius = 0.0;
        assert!(opts.validate().is_err());
    }
}
