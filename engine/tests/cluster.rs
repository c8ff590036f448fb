use std::collections::BTreeSet;

use abstutil::Timer;
use engine::{ClusterIndex, ClusterNode, ClusterOptions};
use model::{AssetId, AssetPoint, AssetStatus, BBox, LatLng};

// Deterministic pseudo-random fleet, bunched up around a few depots like a real one
fn fleet(n: usize) -> Vec<AssetPoint> {
    let depots = [
        LatLng::new(47.61, -122.33),
        LatLng::new(40.71, -74.0),
        LatLng::new(51.5, -0.12),
        LatLng::new(-33.87, 151.21),
        LatLng::new(64.0, 179.9),
    ];
    let mut state: u64 = 42;
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((state >> 11) as f64) / ((1u64 << 53) as f64)
    };
    (0..n)
        .map(|i| {
            let depot = depots[i % depots.len()];
            // Most trucks stay near their depot, a few wander far away
            let spread = if i % 10 == 0 { 20.0 } else { 0.5 };
            let lat = (depot.lat + (next() - 0.5) * spread).clamp(-80.0, 80.0);
            let mut lng = depot.lng + (next() - 0.5) * spread;
            if lng > 180.0 {
                lng -= 360.0;
            }
            if lng < -180.0 {
                lng += 360.0;
            }
            AssetPoint::new(
                AssetId::new(format!("truck{i}")),
                LatLng::new(lat, lng),
                AssetStatus::Active,
            )
        })
        .collect()
}

fn leaf_ids(index: &ClusterIndex, node: &ClusterNode) -> Vec<AssetId> {
    match node {
        ClusterNode::Leaf(pt) => vec![pt.id.clone()],
        ClusterNode::Aggregate(c) => index
            .leaves(c.cluster_id, usize::MAX, 0)
            .unwrap()
            .into_iter()
            .map(|pt| pt.id)
            .collect(),
    }
}

#[test]
fn every_point_appears_once_per_zoom() {
    let points = fleet(5000);
    let options = ClusterOptions::default();
    let index = ClusterIndex::build(points.clone(), &options, &mut Timer::throwaway()).unwrap();
    assert_eq!(index.num_points(), 5000);

    for zoom in 0..=options.max_zoom + 1 {
        let nodes = index.query(&BBox::world(), zoom as f64);
        let total: usize = nodes.iter().map(|n| n.point_count()).sum();
        assert_eq!(total, 5000, "point counts at zoom {zoom}");

        let mut seen = BTreeSet::new();
        for node in &nodes {
            for id in leaf_ids(&index, node) {
                assert!(seen.insert(id.clone()), "{id} appears twice at zoom {zoom}");
            }
        }
        assert_eq!(seen.len(), 5000, "leaves at zoom {zoom}");
    }

    // Everything is a lone marker past the last clustering level
    assert!(index
        .query(&BBox::world(), 20.0)
        .iter()
        .all(|n| matches!(n, ClusterNode::Leaf(_))));
    // And the world view actually merges things
    assert!(index.query(&BBox::world(), 0.0).len() < 100);
}

#[test]
fn children_partition_their_parent() {
    let index =
        ClusterIndex::build(fleet(2000), &ClusterOptions::default(), &mut Timer::throwaway())
            .unwrap();
    for zoom in [0, 3, 8] {
        for node in index.query(&BBox::world(), zoom as f64) {
            if let ClusterNode::Aggregate(c) = node {
                let children = index.children(c.cluster_id).unwrap();
                assert!(!children.is_empty());
                let sum: usize = children.iter().map(|n| n.point_count()).sum();
                assert_eq!(sum, c.point_count);
                assert!(index.expansion_zoom(c.cluster_id).unwrap() > zoom);
                assert!(c.child_zoom_radius > 0.0);

                // Paging through leaves covers the same points as asking for everything
                let all = index.leaves(c.cluster_id, usize::MAX, 0).unwrap();
                let first = index.leaves(c.cluster_id, 10, 0).unwrap();
                let rest = index.leaves(c.cluster_id, usize::MAX, 10).unwrap();
                assert_eq!(first.len(), 10.min(all.len()));
                assert_eq!(first.len() + rest.len(), all.len());
                assert_eq!(first.as_slice(), &all[..first.len()]);
            }
        }
    }
}

#[test]
fn building_is_deterministic() {
    let options = ClusterOptions::default();
    let a = ClusterIndex::build(fleet(3000), &options, &mut Timer::throwaway()).unwrap();
    let b = ClusterIndex::build(fleet(3000), &options, &mut Timer::throwaway()).unwrap();
    for zoom in [0.0, 2.5, 5.0, 11.0, 17.0] {
        assert_eq!(
            a.query(&BBox::world(), zoom),
            b.query(&BBox::world(), zoom),
            "zoom {zoom}"
        );
    }
}

#[test]
fn viewport_across_the_antimeridian() {
    let index =
        ClusterIndex::build(fleet(1000), &ClusterOptions::default(), &mut Timer::throwaway())
            .unwrap();
    // The fifth depot straddles 180 degrees
    let bbox = BBox::new(170.0, 50.0, -170.0, 75.0);
    let nodes = index.query(&bbox, 17.0);
    assert!(!nodes.is_empty());
    assert!(nodes.iter().all(|n| {
        let pos = n.pos();
        pos.lat >= 50.0 && pos.lat <= 75.0 && (pos.lng >= 170.0 || pos.lng <= -170.0)
    }));
}

#[test]
fn world_view_reaches_the_poles() {
    let points = vec![
        AssetPoint::new(
            AssetId::new("arctic"),
            LatLng::new(88.0, 10.0),
            AssetStatus::Active,
        ),
        AssetPoint::new(
            AssetId::new("antarctic"),
            LatLng::new(-89.5, -60.0),
            AssetStatus::Idle,
        ),
    ];
    let index =
        ClusterIndex::build(points, &ClusterOptions::default(), &mut Timer::throwaway()).unwrap();
    let nodes = index.query(&BBox::world(), 17.0);
    assert_eq!(nodes.len(), 2);
}
