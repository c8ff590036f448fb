use abstutil::Timer;
use model::{load_snapshot_csv, load_snapshot_json, AssetId, AssetStatus};

const CSV: &str = "\
id,name,lat,lng,status,has_alert,reported_at
T1,Truck 1,47.61,-122.33,active,false,2024-03-01 08:15:00
T2,,47.62,-122.31,idle,,
T3,Truck 3,,-122.30,maintenance,false,
T4,Truck 4,95.0,-122.30,active,false,
T5,Truck 5,47.60,-122.35,alert,,2024-03-01 08:16:30
";

#[test]
fn csv_snapshot_drops_bad_positions() {
    let snapshot = load_snapshot_csv(CSV.as_bytes(), &mut Timer::throwaway()).unwrap();
    assert_eq!(snapshot.assets.len(), 3);
    assert_eq!(snapshot.skipped, 2);

    let t1 = snapshot.get(&AssetId::new("T1")).unwrap();
    assert_eq!(t1.label(), "Truck 1");
    assert_eq!(t1.status, AssetStatus::Active);
    assert!(t1.reported_at.is_some());

    // No name falls back to the ID
    let t2 = snapshot.get(&AssetId::new("T2")).unwrap();
    assert_eq!(t2.label(), "T2");
    assert!(!t2.has_alert);

    // An alert status implies the flag when the column is blank
    assert!(snapshot.get(&AssetId::new("T5")).unwrap().has_alert);

    assert!(snapshot.gps_bounds.min_lat >= 47.60 - 1e-9);
    assert!(snapshot.gps_bounds.max_lat <= 47.62 + 1e-9);
}

#[test]
fn csv_snapshot_rejects_bad_timestamps() {
    let csv = "id,name,lat,lng,status,has_alert,reported_at\nT1,,1.0,2.0,active,false,yesterday\n";
    assert!(load_snapshot_csv(csv.as_bytes(), &mut Timer::throwaway()).is_err());
}

#[test]
fn json_snapshot() {
    let json = r#"[
        {"id": "A", "lat": 1.0, "lng": 2.0, "status": "active", "hasAlert": true},
        {"id": "B", "lat": 1.5, "lng": 2.5, "status": "idle"}
    ]"#;
    let snapshot = load_snapshot_json(json.as_bytes()).unwrap();
    assert_eq!(snapshot.assets.len(), 2);
    assert!(snapshot.assets[0].has_alert);
    assert!(!snapshot.assets[1].has_alert);
    assert_eq!(snapshot.skipped, 0);
}
