//! Groups thousands of asset positions into a handful of markers per zoom level.
//!
//! Everything is computed up-front: starting from the raw points one level past `max_zoom`, each
//! coarser zoom level is produced by merging nearby nodes of the level below it. A query then just
//! looks up the nodes of one level inside the viewport. The index is never updated in place; when
//! the fleet snapshot changes, build a new one.

use std::f64::consts::PI;

use abstutil::{prettyprint_usize, Timer};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use serde::Serialize;

use model::{AssetPoint, BBox, LatLng, EARTH_RADIUS_METERS};

use crate::config::ClusterOptions;
use crate::{EngineError, Result};

type IndexedPt = GeomWithData<[f64; 2], usize>;

/// What to draw for one marker at some zoom level.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ClusterNode {
    Leaf(AssetPoint),
    Aggregate(ClusterSummary),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: usize,
    /// Weighted by the number of points in each merged child
    pub centroid: LatLng,
    pub point_count: usize,
    pub point_count_abbreviated: String,
    /// The clustering radius at this zoom level, in meters at the centroid's latitude
    pub child_zoom_radius: f64,
}

impl ClusterNode {
    pub fn point_count(&self) -> usize {
        match self {
            ClusterNode::Leaf(_) => 1,
            ClusterNode::Aggregate(c) => c.point_count,
        }
    }

    pub fn pos(&self) -> LatLng {
        match self {
            ClusterNode::Leaf(pt) => pt.pos(),
            ClusterNode::Aggregate(c) => c.centroid,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum NodeKind {
    /// Index into ClusterIndex::points
    Leaf(usize),
    Cluster(usize),
}

#[derive(Clone, Debug)]
struct Node {
    // Spherical mercator, scaled to [0, 1]
    x: f64,
    y: f64,
    num_points: usize,
    kind: NodeKind,
    // Filled out while building the next coarser level
    visited: bool,
    parent: Option<usize>,
}

impl Node {
    fn carry_over(&self) -> Node {
        Node {
            visited: false,
            parent: None,
            ..self.clone()
        }
    }
}

struct Level {
    zoom: u8,
    nodes: Vec<Node>,
    tree: RTree<IndexedPt>,
}

impl Level {
    fn new(zoom: u8, nodes: Vec<Node>) -> Self {
        let tree = RTree::bulk_load(
            nodes
                .iter()
                .enumerate()
                .map(|(idx, n)| GeomWithData::new([n.x, n.y], idx))
                .collect(),
        );
        Self { zoom, nodes, tree }
    }

    /// Indices of nodes within `r` of a position, in index order
    fn within(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        let mut result: Vec<usize> = self
            .tree
            .locate_within_distance([x, y], r * r)
            .map(|pt| pt.data)
            .collect();
        result.sort_unstable();
        result
    }
}

pub struct ClusterIndex {
    options: ClusterOptions,
    points: Vec<AssetPoint>,
    // Ordered from min_zoom to max_zoom + 1. The last level holds the raw points.
    levels: Vec<Level>,
}

impl ClusterIndex {
    /// Assets without a usable position are dropped first; they can't be placed on the map.
    pub fn build(
        points: Vec<AssetPoint>,
        options: &ClusterOptions,
        timer: &mut Timer,
    ) -> anyhow::Result<Self> {
        options.validate()?;
        timer.start("build cluster index");

        let input_len = points.len();
        let points: Vec<AssetPoint> = points
            .into_iter()
            .filter(|pt| pt.has_valid_position())
            .collect();
        if points.len() != input_len {
            warn!(
                "Not clustering {} assets with invalid positions",
                prettyprint_usize(input_len - points.len())
            );
        }

        let leaves: Vec<Node> = points
            .iter()
            .enumerate()
            .map(|(idx, pt)| Node {
                x: lng_x(pt.lng),
                y: lat_y(pt.lat),
                num_points: 1,
                kind: NodeKind::Leaf(idx),
                visited: false,
                parent: None,
            })
            .collect();

        let mut levels = Vec::new();
        let mut finer = Level::new(options.max_zoom + 1, leaves);
        for zoom in (options.min_zoom..=options.max_zoom).rev() {
            let nodes = cluster_level(&mut finer, zoom, options);
            levels.push(finer);
            finer = Level::new(zoom, nodes);
        }
        levels.push(finer);
        levels.reverse();

        info!(
            "Clustered {} assets into {} markers at zoom {}",
            prettyprint_usize(points.len()),
            prettyprint_usize(levels[0].nodes.len()),
            options.min_zoom
        );
        timer.stop("build cluster index");

        Ok(Self {
            options: options.clone(),
            points,
            levels,
        })
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Returns the clusters and lone points at some zoom level inside a viewport. Fractional zooms
    /// round down.
    pub fn query(&self, bbox: &BBox, zoom: f64) -> Vec<ClusterNode> {
        let mut min_lng = normalize_lng(bbox.west);
        let min_lat = bbox.south.clamp(-90.0, 90.0);
        let mut max_lng = if bbox.east == 180.0 {
            180.0
        } else {
            normalize_lng(bbox.east)
        };
        let max_lat = bbox.north.clamp(-90.0, 90.0);

        if bbox.east - bbox.west >= 360.0 {
            min_lng = -180.0;
            max_lng = 180.0;
        } else if min_lng > max_lng {
            // Crossing the antimeridian; query both sides
            let mut result = self.query(&BBox::new(min_lng, min_lat, 180.0, max_lat), zoom);
            result.extend(self.query(&BBox::new(-180.0, min_lat, max_lng, max_lat), zoom));
            return result;
        }

        let level = self.level(self.limit_zoom(zoom));
        let envelope = AABB::from_corners(
            [lng_x(min_lng), lat_y(max_lat)],
            [lng_x(max_lng), lat_y(min_lat)],
        );
        let mut ids: Vec<usize> = level
            .tree
            .locate_in_envelope(&envelope)
            .map(|pt| pt.data)
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|idx| self.to_cluster_node(level, &level.nodes[idx]))
            .collect()
    }

    /// The nodes one zoom level deeper that a cluster was built from
    pub fn children(&self, cluster_id: usize) -> Result<Vec<ClusterNode>> {
        let (level, ids) = self.child_ids(cluster_id)?;
        Ok(ids
            .into_iter()
            .map(|idx| self.to_cluster_node(level, &level.nodes[idx]))
            .collect())
    }

    /// Pages through all of the individual assets inside a cluster.
    pub fn leaves(&self, cluster_id: usize, limit: usize, offset: usize) -> Result<Vec<AssetPoint>> {
        let mut result = Vec::new();
        let mut skipped = 0;
        self.append_leaves(cluster_id, limit, offset, &mut skipped, &mut result)?;
        Ok(result)
    }

    /// The zoom level where a cluster breaks apart into more than one marker. Zooming the map
    /// here on click is the usual way to expand a cluster.
    pub fn expansion_zoom(&self, mut cluster_id: usize) -> Result<u8> {
        let mut zoom = decode_zoom(cluster_id);
        while zoom <= self.options.max_zoom {
            let children = self.children(cluster_id)?;
            zoom += 1;
            match children.as_slice() {
                [ClusterNode::Aggregate(only)] => {
                    cluster_id = only.cluster_id;
                }
                _ => break,
            }
        }
        Ok(zoom)
    }

    fn append_leaves(
        &self,
        cluster_id: usize,
        limit: usize,
        offset: usize,
        skipped: &mut usize,
        result: &mut Vec<AssetPoint>,
    ) -> Result<()> {
        let (level, ids) = self.child_ids(cluster_id)?;
        for idx in ids {
            if result.len() == limit {
                break;
            }
            let node = &level.nodes[idx];
            match node.kind {
                NodeKind::Cluster(child) => {
                    if *skipped + node.num_points <= offset {
                        // Skip the whole cluster
                        *skipped += node.num_points;
                    } else {
                        self.append_leaves(child, limit, offset, skipped, result)?;
                    }
                }
                NodeKind::Leaf(pt) => {
                    if *skipped < offset {
                        *skipped += 1;
                    } else {
                        result.push(self.points[pt].clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn child_ids(&self, cluster_id: usize) -> Result<(&Level, Vec<usize>)> {
        let origin_zoom = decode_zoom(cluster_id);
        let origin_idx = cluster_id >> 5;
        if cluster_id & 31 == 0
            || origin_zoom < self.options.min_zoom
            || origin_zoom > self.options.max_zoom
        {
            return Err(EngineError::UnknownCluster(cluster_id));
        }
        let level = self.level(origin_zoom + 1);
        let origin = match level.nodes.get(origin_idx) {
            Some(node) => node,
            None => return Err(EngineError::UnknownCluster(cluster_id)),
        };
        // Everything merged into the cluster was within the radius of the origin. Pad slightly so
        // float noise can't lose a child.
        let r = cluster_radius(&self.options, origin_zoom) * (1.0 + 1e-9);
        let ids: Vec<usize> = level
            .within(origin.x, origin.y, r)
            .into_iter()
            .filter(|idx| level.nodes[*idx].parent == Some(cluster_id))
            .collect();
        if ids.is_empty() {
            return Err(EngineError::UnknownCluster(cluster_id));
        }
        Ok((level, ids))
    }

    fn limit_zoom(&self, zoom: f64) -> u8 {
        if zoom.is_nan() {
            return self.options.min_zoom;
        }
        let zoom = zoom.floor().max(self.options.min_zoom as f64);
        zoom.min(self.options.max_zoom as f64 + 1.0) as u8
    }

    fn level(&self, zoom: u8) -> &Level {
        &self.levels[(zoom - self.options.min_zoom) as usize]
    }

    fn to_cluster_node(&self, level: &Level, node: &Node) -> ClusterNode {
        match node.kind {
            NodeKind::Leaf(idx) => ClusterNode::Leaf(self.points[idx].clone()),
            NodeKind::Cluster(cluster_id) => {
                let centroid = LatLng::new(y_lat(node.y), x_lng(node.x));
                let radius = cluster_radius(&self.options, level.zoom);
                ClusterNode::Aggregate(ClusterSummary {
                    cluster_id,
                    centroid,
                    point_count: node.num_points,
                    point_count_abbreviated: abbreviate_count(node.num_points),
                    child_zoom_radius: radius
                        * 2.0
                        * PI
                        * EARTH_RADIUS_METERS
                        * centroid.lat.to_radians().cos(),
                })
            }
        }
    }
}

/// Produces the nodes for `zoom` by merging neighbors from the next finer level. Nodes are scanned
/// in index order, so the result only depends on the input order.
fn cluster_level(finer: &mut Level, zoom: u8, options: &ClusterOptions) -> Vec<Node> {
    let r = cluster_radius(options, zoom);
    let mut result = Vec::new();

    for idx in 0..finer.nodes.len() {
        if finer.nodes[idx].visited {
            continue;
        }
        finer.nodes[idx].visited = true;

        let (x, y) = (finer.nodes[idx].x, finer.nodes[idx].y);
        let neighbors = finer.within(x, y, r);

        let num_points_origin = finer.nodes[idx].num_points;
        let mut num_points = num_points_origin;
        for n in &neighbors {
            if !finer.nodes[*n].visited {
                num_points += finer.nodes[*n].num_points;
            }
        }

        if num_points > num_points_origin && num_points >= options.min_points {
            let cluster_id = (idx << 5) + (zoom as usize + 1);
            let mut wx = x * num_points_origin as f64;
            let mut wy = y * num_points_origin as f64;
            for n in neighbors {
                let neighbor = &mut finer.nodes[n];
                if neighbor.visited {
                    continue;
                }
                neighbor.visited = true;
                neighbor.parent = Some(cluster_id);
                wx += neighbor.x * neighbor.num_points as f64;
                wy += neighbor.y * neighbor.num_points as f64;
            }
            finer.nodes[idx].parent = Some(cluster_id);
            result.push(Node {
                x: wx / num_points as f64,
                y: wy / num_points as f64,
                num_points,
                kind: NodeKind::Cluster(cluster_id),
                visited: false,
                parent: None,
            });
        } else {
            result.push(finer.nodes[idx].carry_over());
            if num_points > 1 {
                // Too few to cluster (min_points > 2), so the neighbors stay separate too
                for n in neighbors {
                    if finer.nodes[n].visited {
                        continue;
                    }
                    finer.nodes[n].visited = true;
                    result.push(finer.nodes[n].carry_over());
                }
            }
        }
    }

    result
}

fn cluster_radius(options: &ClusterOptions, zoom: u8) -> f64 {
    options.radius / (options.extent * 2.0_f64.powi(zoom as i32))
}

fn decode_zoom(cluster_id: usize) -> u8 {
    ((cluster_id & 31) as u8).saturating_sub(1)
}

fn normalize_lng(lng: f64) -> f64 {
    ((lng + 180.0) % 360.0 + 360.0) % 360.0 - 180.0
}

fn lng_x(lng: f64) -> f64 {
    lng / 360.0 + 0.5
}

fn lat_y(lat: f64) -> f64 {
    let sin = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / PI;
    y.clamp(0.0, 1.0)
}

fn x_lng(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

fn y_lat(y: f64) -> f64 {
    let y2 = (180.0 - y * 360.0).to_radians();
    360.0 * y2.exp().atan() / PI - 90.0
}

/// 950 stays "950", 1234 becomes "1.2k", 25300 becomes "25k"
pub fn abbreviate_count(count: usize) -> String {
    if count >= 10_000 {
        format!("{}k", (count as f64 / 1000.0).round())
    } else if count >= 1000 {
        format!("{}k", (count as f64 / 100.0).round() / 10.0)
    } else {
        count.to_string()
    }
}

/// Converts query results into GeoJSON points for the map SDK's marker layer.
pub fn to_geojson(nodes: &[ClusterNode]) -> FeatureCollection {
    let largest = nodes.iter().map(|n| n.point_count()).max().unwrap_or(1);
    let features = nodes
        .iter()
        .map(|node| {
            let pos = node.pos();
            let mut properties = JsonObject::new();
            match node {
                ClusterNode::Leaf(pt) => {
                    properties.insert("cluster".to_string(), false.into());
                    properties.insert("id".to_string(), pt.id.0.clone().into());
                    properties.insert("label".to_string(), pt.label().into());
                    properties.insert(
                        "status".to_string(),
                        serde_json::to_value(pt.status).unwrap_or_default(),
                    );
                    properties.insert("has_alert".to_string(), pt.has_alert.into());
                }
                ClusterNode::Aggregate(c) => {
                    properties.insert("cluster".to_string(), true.into());
                    properties.insert("cluster_id".to_string(), c.cluster_id.into());
                    properties.insert("point_count".to_string(), c.point_count.into());
                    properties.insert(
                        "point_count_abbreviated".to_string(),
                        c.point_count_abbreviated.clone().into(),
                    );
                    properties.insert(
                        "marker_color".to_string(),
                        marker_color(c.point_count, largest).into(),
                    );
                }
            }
            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Point(vec![pos.lng, pos.lat]))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

// Bigger clusters get hotter colors, on a log scale relative to the biggest one on screen
fn marker_color(count: usize, largest: usize) -> String {
    let pct = if largest <= 1 {
        0.0
    } else {
        (count as f64).ln() / (largest as f64).ln()
    };
    let color = colorous::YELLOW_ORANGE_RED.eval_continuous(0.3 + 0.7 * pct.clamp(0.0, 1.0));
    format!("#{:x}", color)
}

#[cfg(test)]
mod tests {
    use model::{AssetId, AssetStatus};

    use super::*;

    fn asset(id: usize, lat: f64, lng: f64) -> AssetPoint {
        AssetPoint::new(
            AssetId::new(format!("truck{id}")),
            LatLng::new(lat, lng),
            AssetStatus::Active,
        )
    }

    fn build(points: Vec<AssetPoint>) -> ClusterIndex {
        ClusterIndex::build(points, &ClusterOptions::default(), &mut Timer::throwaway()).unwrap()
    }

    #[test]
    fn projection_round_trips() {
        for (lat, lng) in [(0.0, 0.0), (47.6, -122.3), (-33.9, 151.2), (84.0, 179.0)] {
            assert!((y_lat(lat_y(lat)) - lat).abs() < 1e-9);
            assert!((x_lng(lng_x(lng)) - lng).abs() < 1e-9);
        }
    }

    #[test]
    fn abbreviations() {
        assert_eq!(abbreviate_count(7), "7");
        assert_eq!(abbreviate_count(999), "999");
        assert_eq!(abbreviate_count(1000), "1k");
        assert_eq!(abbreviate_count(1234), "1.2k");
        assert_eq!(abbreviate_count(9960), "10k");
        assert_eq!(abbreviate_count(25_300), "25k");
    }

    #[test]
    fn empty_input() {
        let index = build(Vec::new());
        assert!(index.query(&BBox::world(), 3.0).is_empty());
        assert!(matches!(
            index.children(33),
            Err(EngineError::UnknownCluster(33))
        ));
    }

    #[test]
    fn invalid_points_are_dropped() {
        let index = build(vec![
            asset(0, 10.0, 10.0),
            asset(1, f64::NAN, 10.0),
            asset(2, 10.0, f64::INFINITY),
        ]);
        assert_eq!(index.num_points(), 1);
    }

    #[test]
    fn nearby_points_merge_when_zoomed_out() {
        // Two trucks about 100m apart, one far away
        let index = build(vec![
            asset(0, 47.6000, -122.3000),
            asset(1, 47.6009, -122.3000),
            asset(2, -33.9, 151.2),
        ]);

        let zoomed_out = index.query(&BBox::world(), 5.0);
        assert_eq!(zoomed_out.len(), 2);
        let cluster = match &zoomed_out[0] {
            ClusterNode::Aggregate(c) => c.clone(),
            x => panic!("expected a cluster, got {:?}", x),
        };
        assert_eq!(cluster.point_count, 2);
        assert_eq!(cluster.point_count_abbreviated, "2");
        assert!((cluster.centroid.lat - 47.60045).abs() < 1e-6);
        assert!((cluster.centroid.lng + 122.3).abs() < 1e-9);
        assert!(cluster.child_zoom_radius > 0.0);

        // At the raw level, everything is separate
        let zoomed_in = index.query(&BBox::world(), 17.0);
        assert_eq!(zoomed_in.len(), 3);
        assert!(zoomed_in.iter().all(|n| matches!(n, ClusterNode::Leaf(_))));

        let mut leaves: Vec<String> = index
            .leaves(cluster.cluster_id, usize::MAX, 0)
            .unwrap()
            .into_iter()
            .map(|pt| pt.id.0)
            .collect();
        leaves.sort();
        assert_eq!(leaves, vec!["truck0", "truck1"]);

        let expand = index.expansion_zoom(cluster.cluster_id).unwrap();
        assert!(expand > 5 && expand <= 17);
        let split = index.query(&BBox::world(), expand as f64);
        assert_eq!(split.len(), 3);
        let before = index.query(&BBox::world(), (expand - 1) as f64);
        assert_eq!(before.len(), 2);
    }

    #[test]
    fn viewport_filters_and_antimeridian() {
        let index = build(vec![
            asset(0, 0.0, 179.5),
            asset(1, 0.0, -179.5),
            asset(2, 0.0, 0.0),
        ]);
        let east_only = index.query(&BBox::new(170.0, -10.0, 180.0, 10.0), 16.0);
        assert_eq!(east_only.len(), 1);

        let across = index.query(&BBox::new(170.0, -10.0, -170.0, 10.0), 16.0);
        assert_eq!(across.len(), 2);
        assert!(across.iter().all(|n| n.pos().lng.abs() > 179.0));

        let everything = index.query(&BBox::new(-200.0, -90.0, 200.0, 90.0), 16.0);
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn min_points_keeps_small_groups_apart() {
        let mut options = ClusterOptions::default();
        options.min_points = 3;
        let index = ClusterIndex::build(
            vec![asset(0, 10.0, 10.0), asset(1, 10.0001, 10.0)],
            &options,
            &mut Timer::throwaway(),
        )
        .unwrap();
        let nodes = index.query(&BBox::world(), 0.0);
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| matches!(n, ClusterNode::Leaf(_))));
    }

    #[test]
    fn geojson_output() {
        let index = build(vec![asset(0, 10.0, 10.0), asset(1, 10.0001, 10.0)]);
        let gj = to_geojson(&index.query(&BBox::world(), 2.0));
        assert_eq!(gj.features.len(), 1);
        let props = gj.features[0].properties.as_ref().unwrap();
        assert_eq!(props["cluster"], true);
        assert_eq!(props["point_count"], 2);
        assert!(props["marker_color"].as_str().unwrap().starts_with('#'));
    }
}
