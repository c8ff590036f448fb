#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use abstutil::{prettyprint_usize, Timer};
use anyhow::Result;
use futures_channel::mpsc::unbounded;
use structopt::StructOpt;

use engine::{
    to_geojson, to_wire_format, ClusterIndex, ClusterNode, EngineConfig, PositionUpdate,
    RouteAnimationScheduler, RouteCandidate, RouteProvider, RouteRequest, TrackingSession,
};
use model::{
    load_snapshot_csv, load_snapshot_json, AssetId, BBox, FleetSnapshot, Geofence, ShapeId,
    WirePayload,
};

#[derive(StructOpt)]
struct Args {
    /// The path to a JSON file overriding engine settings
    #[structopt(long)]
    config: Option<String>,
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Clusters a fleet snapshot and writes the markers for one viewport as GeoJSON
    Cluster {
        /// A CSV or JSON snapshot of asset positions
        #[structopt(long)]
        snapshot: String,
        #[structopt(long, default_value = "0")]
        zoom: f64,
        /// The viewport as "west,south,east,north". Defaults to the whole world.
        #[structopt(long)]
        bbox: Option<String>,
        #[structopt(long, default_value = "clusters.geojson")]
        output: String,
    },
    /// Drives one truck along recorded directions, reporting geofence alerts
    Track {
        #[structopt(long)]
        asset: String,
        /// A JSON list of route candidates, as returned by the directions service
        #[structopt(long)]
        directions: String,
        /// A JSON object mapping geofence IDs to their wire format
        #[structopt(long)]
        geofences: String,
        /// Where to write the alerts as JSON
        #[structopt(long)]
        output: Option<String>,
    },
    /// Validates geofences and converts them to the wire format
    ExportGeofences {
        /// A JSON list of geofences
        #[structopt(long)]
        input: String,
        #[structopt(long, default_value = "geofences_wire.json")]
        output: String,
    },
}

fn main() -> Result<()> {
    abstutil::logger::setup();

    let args = Args::from_iter(abstutil::cli_args());
    let mut timer = Timer::new("fleet");
    let config = match args.config {
        Some(path) => abstio::maybe_read_json::<EngineConfig>(path, &mut timer)?,
        None => EngineConfig::default(),
    };

    match args.cmd {
        Command::Cluster {
            snapshot,
            zoom,
            bbox,
            output,
        } => {
            let snapshot = load_snapshot(&snapshot, &mut timer)?;
            let bbox = match bbox {
                Some(raw) => BBox::parse(&raw)?,
                None => BBox::world(),
            };
            let index = ClusterIndex::build(snapshot.assets, &config.cluster, &mut timer)?;
            let nodes = index.query(&bbox, zoom);
            let clusters = nodes
                .iter()
                .filter(|n| matches!(n, ClusterNode::Aggregate(_)))
                .count();
            info!(
                "{} markers at zoom {zoom}, {} of them clusters",
                prettyprint_usize(nodes.len()),
                prettyprint_usize(clusters)
            );
            abstio::write_json(output, &to_geojson(&nodes));
        }
        Command::Track {
            asset,
            directions,
            geofences,
            output,
        } => {
            let candidates =
                abstio::maybe_read_json::<Vec<RouteCandidate>>(directions, &mut timer)?;
            let geofences = load_geofences(geofences, &mut timer)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_time()
                .build()?;
            let alerts = runtime.block_on(track(
                &config,
                AssetId::new(asset),
                RecordedDirections(candidates),
                geofences,
            ))?;
            if let Some(path) = output {
                abstio::write_json(path, &alerts);
            }
        }
        Command::ExportGeofences { input, output } => {
            let geofences = abstio::maybe_read_json::<Vec<Geofence>>(input, &mut timer)?;
            let mut results = BTreeMap::new();
            for geofence in geofences {
                match to_wire_format(&geofence) {
                    Ok(payload) => {
                        results.insert(geofence.id.0.clone(), payload);
                    }
                    Err(err) => {
                        warn!("Skipping geofence {}: {err}", geofence.id);
                    }
                }
            }
            info!("Exported {} geofences", prettyprint_usize(results.len()));
            abstio::write_json(output, &results);
        }
    }
    Ok(())
}

fn load_snapshot(path: &str, timer: &mut Timer) -> Result<FleetSnapshot> {
    let file = fs_err::File::open(path)?;
    if path.ends_with(".csv") {
        load_snapshot_csv(file, timer)
    } else if path.ends_with(".json") {
        load_snapshot_json(file)
    } else {
        bail!("Don't know how to read snapshot {path}; use .csv or .json");
    }
}

fn load_geofences(path: String, timer: &mut Timer) -> Result<Vec<Geofence>> {
    let raw = abstio::maybe_read_json::<BTreeMap<String, WirePayload>>(path, timer)?;
    let mut geofences = Vec::new();
    for (id, payload) in raw {
        match payload.to_geofence(ShapeId::new(id)) {
            Ok(geofence) => geofences.push(geofence),
            Err(err) => warn!("Skipping geofence: {err}"),
        }
    }
    Ok(geofences)
}

/// Replays a saved response from the directions service, no matter what's asked.
struct RecordedDirections(Vec<RouteCandidate>);

impl RouteProvider for RecordedDirections {
    fn directions(
        &self,
        _: &RouteRequest,
    ) -> impl Future<Output = Result<Vec<RouteCandidate>>> + Send {
        let candidates = self.0.clone();
        async move { Ok(candidates) }
    }
}

async fn track(
    config: &EngineConfig,
    asset: AssetId,
    directions: RecordedDirections,
    geofences: Vec<Geofence>,
) -> Result<Vec<engine::AlertEvent>> {
    let route = match directions.0.first() {
        Some(candidate) => candidate.to_polyline()?,
        None => bail!("The directions file has no routes"),
    };
    let (origin, destination) = match (route.points().first(), route.points().last()) {
        (Some(origin), Some(destination)) => (*origin, *destination),
        _ => bail!("The first route is empty"),
    };

    let scheduler = RouteAnimationScheduler::new(&config.animation);
    let (session, mut alerts) = TrackingSession::new(config.alert_policy, geofences);
    scheduler.subscribe(session.clone());
    let (positions_tx, mut positions) = unbounded::<PositionUpdate>();
    scheduler.subscribe(Arc::new(positions_tx));

    let route = scheduler
        .animate_route(&asset, &directions, &RouteRequest::driving(origin, destination))
        .await?;
    info!(
        "Driving {asset} along {} points, {}m long",
        prettyprint_usize(route.len()),
        route.length_meters().round()
    );

    let mut ticks = 0;
    while scheduler.is_animating(&asset) {
        tokio::time::sleep(config.animation.tick_interval()).await;
        while let Ok(Some(update)) = positions.try_next() {
            debug!(
                "{} at {} heading {:.0}",
                update.asset, update.position, update.heading_degrees
            );
            ticks += 1;
        }
    }
    scheduler.stop_all();

    let mut results = Vec::new();
    while let Ok(Some(event)) = alerts.try_next() {
        println!(
            "{} entered {} ({}) at {}",
            event.truck, event.geofence_name, event.shape_id, event.position
        );
        results.push(event);
    }
    info!(
        "{} moves, {} alerts",
        prettyprint_usize(ticks),
        prettyprint_usize(results.len())
    );
    Ok(results)
}
