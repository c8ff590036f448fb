//! Moves truck markers along precomputed routes. Every animated truck gets its own tokio task
//! ticking on a fixed interval, with its own state behind its own lock, so trucks never wait on
//! each other.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_channel::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use model::{AssetId, LatLng, RoutePolyline};

use crate::config::AnimationConfig;
use crate::routing::{RequestGate, RouteProvider, RouteRequest};
use crate::{EngineError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct PositionUpdate {
    pub asset: AssetId,
    /// Index into the route
    pub index: usize,
    pub position: LatLng,
    pub heading_degrees: f64,
}

/// Receives every position update, synchronously inside the tick that produced it. Sinks must not
/// call into the scheduler at all; the asset's state is locked while they run.
pub trait PositionSink: Send + Sync {
    fn on_position(&self, update: &PositionUpdate);
}

/// Forwards updates to a renderer running elsewhere.
impl PositionSink for UnboundedSender<PositionUpdate> {
    fn on_position(&self, update: &PositionUpdate) {
        if self.unbounded_send(update.clone()).is_err() {
            trace!("Position receiver for {} is gone", update.asset);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Animating,
    Finished,
}

#[derive(Clone, Debug)]
pub struct AnimationState {
    pub asset_name: AssetId,
    pub points: Arc<RoutePolyline>,
    /// Always a valid index into `points`
    pub current_index: usize,
    pub heading_degrees: f64,
    pub current_position: LatLng,
    pub phase: Phase,
    // Bumped every time the timer is cancelled, so a tick that was already waiting on the lock
    // knows it's obsolete.
    generation: u64,
}

impl AnimationState {
    /// Starts out idle at the first point. Vertices that aren't finite are dropped; if nothing
    /// is left, there's nothing to animate.
    pub fn new(asset_name: AssetId, points: Arc<RoutePolyline>) -> Result<Self> {
        let points = if points.points().iter().all(|pt| pt.is_finite()) {
            points
        } else {
            let mut copy = (*points).clone();
            let removed = copy.retain_finite();
            warn!("Route for {asset_name} had {removed} invalid points; skipping them");
            Arc::new(copy)
        };
        let first = match points.points().first() {
            Some(pt) => *pt,
            None => {
                return Err(EngineError::InvalidGeometry(format!(
                    "route for {asset_name} has no valid points"
                )));
            }
        };
        let heading_degrees = match points.points().get(1) {
            Some(next) => first.bearing_to(*next),
            None => 0.0,
        };
        Ok(Self {
            asset_name,
            points,
            current_index: 0,
            heading_degrees,
            current_position: first,
            phase: Phase::Idle,
            generation: 0,
        })
    }

    pub fn is_animating(&self) -> bool {
        self.phase == Phase::Animating
    }

    /// Advances one point along the route. At the last point, the animation finishes instead and
    /// nothing is emitted.
    pub fn tick(&mut self) -> Option<PositionUpdate> {
        if self.phase != Phase::Animating {
            return None;
        }
        let pts = self.points.points();
        if self.current_index + 1 >= pts.len() {
            self.phase = Phase::Finished;
            return None;
        }
        self.heading_degrees = pts[self.current_index].bearing_to(pts[self.current_index + 1]);
        self.current_index += 1;
        self.current_position = pts[self.current_index];
        Some(PositionUpdate {
            asset: self.asset_name.clone(),
            index: self.current_index,
            position: self.current_position,
            heading_degrees: self.heading_degrees,
        })
    }

    fn cancel(&mut self) {
        self.generation += 1;
        if self.phase == Phase::Animating {
            self.phase = Phase::Idle;
        }
    }

    fn rewind(&mut self) {
        self.current_index = 0;
        self.current_position = self.points.points()[0];
        self.heading_degrees = match self.points.points().get(1) {
            Some(next) => self.current_position.bearing_to(*next),
            None => 0.0,
        };
    }
}

struct Animation {
    state: Arc<Mutex<AnimationState>>,
    task: Option<JoinHandle<()>>,
}

type Sinks = Arc<RwLock<Vec<Arc<dyn PositionSink>>>>;

pub struct RouteAnimationScheduler {
    tick_interval: Duration,
    animations: Mutex<BTreeMap<AssetId, Animation>>,
    sinks: Sinks,
    route_requests: RequestGate,
}

impl RouteAnimationScheduler {
    pub fn new(config: &AnimationConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            animations: Mutex::new(BTreeMap::new()),
            sinks: Arc::new(RwLock::new(Vec::new())),
            route_requests: RequestGate::new(),
        }
    }

    pub fn subscribe(&self, sink: Arc<dyn PositionSink>) {
        match self.sinks.write() {
            Ok(mut sinks) => sinks.push(sink),
            Err(err) => err.into_inner().push(sink),
        }
    }

    /// Begins moving the asset along the route from its first point, replacing anything it was
    /// already doing. This has to be called from inside a tokio runtime.
    pub fn start(&self, asset: &AssetId, points: Arc<RoutePolyline>) -> Result<()> {
        // A route someone is still waiting on would override this one
        self.route_requests.cancel(asset);
        self.start_route(asset, points)
    }

    fn start_route(&self, asset: &AssetId, points: Arc<RoutePolyline>) -> Result<()> {
        let mut animations = self.lock_animations();
        if let Some(existing) = animations.get_mut(asset) {
            stop_animation(existing);
        }

        let mut state = match AnimationState::new(asset.clone(), points) {
            Ok(state) => state,
            Err(err) => {
                warn!("Not animating {asset}: {err}");
                return Err(err);
            }
        };
        state.phase = Phase::Animating;
        let generation = state.generation;
        debug!("Animating {asset} along {} points", state.points.len());

        let state = Arc::new(Mutex::new(state));
        let task = tokio::spawn(run_ticks(
            state.clone(),
            generation,
            self.sinks.clone(),
            self.tick_interval,
        ));
        animations.insert(
            asset.clone(),
            Animation {
                state,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Fetches a route, then animates along the first candidate. If another route request or an
    /// explicit start or stop for the same asset happens first, the fetched route is discarded.
    pub async fn animate_route<P: RouteProvider>(
        &self,
        asset: &AssetId,
        provider: &P,
        request: &RouteRequest,
    ) -> Result<Arc<RoutePolyline>> {
        let ticket = self.route_requests.begin(asset);
        let candidates = provider.directions(request).await.map_err(|err| {
            warn!("Directions for {asset} failed: {err}");
            EngineError::ExternalService(err.to_string())
        })?;
        self.route_requests.check(&ticket)?;

        let first = match candidates.first() {
            Some(route) => route,
            None => {
                warn!("No routes found for {asset}");
                return Err(EngineError::ExternalService(format!(
                    "no routes found for {asset}"
                )));
            }
        };
        let polyline = first
            .to_polyline()
            .map_err(|err| EngineError::InvalidGeometry(err.to_string()))?;
        let polyline = Arc::new(polyline);
        self.start_route(asset, polyline.clone())?;
        Ok(polyline)
    }

    /// Cancels the timer. Once this returns, no more updates for the asset are emitted. Does
    /// nothing if the asset isn't animating.
    pub fn stop(&self, asset: &AssetId) {
        self.route_requests.cancel(asset);
        if let Some(animation) = self.lock_animations().get_mut(asset) {
            stop_animation(animation);
        }
    }

    /// Stops and moves back to the start of the route.
    pub fn reset(&self, asset: &AssetId) -> Result<()> {
        self.route_requests.cancel(asset);
        let mut animations = self.lock_animations();
        let animation = match animations.get_mut(asset) {
            Some(animation) => animation,
            None => return Err(EngineError::UnknownAsset(asset.clone())),
        };
        stop_animation(animation);
        let mut state = lock_state(&animation.state);
        state.rewind();
        state.phase = Phase::Idle;
        Ok(())
    }

    /// Stops everything and forgets all routes, like at the end of a tracking session.
    pub fn stop_all(&self) {
        let mut animations = self.lock_animations();
        for (asset, animation) in animations.iter_mut() {
            self.route_requests.cancel(asset);
            stop_animation(animation);
        }
        animations.clear();
    }

    pub fn snapshot(&self, asset: &AssetId) -> Option<AnimationState> {
        self.lock_animations()
            .get(asset)
            .map(|animation| lock_state(&animation.state).clone())
    }

    pub fn is_animating(&self, asset: &AssetId) -> bool {
        self.snapshot(asset)
            .map(|state| state.is_animating())
            .unwrap_or(false)
    }

    pub fn animating_assets(&self) -> Vec<AssetId> {
        self.lock_animations()
            .iter()
            .filter(|(_, animation)| lock_state(&animation.state).is_animating())
            .map(|(asset, _)| asset.clone())
            .collect()
    }

    fn lock_animations(&self) -> MutexGuard<BTreeMap<AssetId, Animation>> {
        match self.animations.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }
}

impl Drop for RouteAnimationScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn lock_state(state: &Mutex<AnimationState>) -> MutexGuard<AnimationState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
    }
}

fn stop_animation(animation: &mut Animation) {
    lock_state(&animation.state).cancel();
    if let Some(task) = animation.task.take() {
        task.abort();
    }
}

async fn run_ticks(
    state: Arc<Mutex<AnimationState>>,
    generation: u64,
    sinks: Sinks,
    period: Duration,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if !tick_once(&state, generation, &sinks) {
            return;
        }
    }
}

// Returns false once the animation is over, one way or another
fn tick_once(state: &Mutex<AnimationState>, generation: u64, sinks: &Sinks) -> bool {
    // The lock is held while sinks run, so a concurrent stop() can't return until this update has
    // been delivered, and no update can sneak out after it.
    let mut state = lock_state(state);
    if state.generation != generation {
        return false;
    }
    match state.tick() {
        Some(update) => {
            let sinks = match sinks.read() {
                Ok(guard) => guard,
                Err(err) => err.into_inner(),
            };
            for sink in sinks.iter() {
                sink.on_position(&update);
            }
            true
        }
        None => {
            debug!("{} reached the end of its route", state.asset_name);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_channel::mpsc::unbounded;

    use super::*;

    fn route(n: usize) -> Arc<RoutePolyline> {
        Arc::new(RoutePolyline::new(
            (0..n)
                .map(|i| LatLng::new(47.6 + 0.001 * i as f64, -122.3))
                .collect(),
        ))
    }

    #[test]
    fn state_machine_without_timers() {
        let mut state = AnimationState::new(AssetId::new("t"), route(3)).unwrap();
        assert_eq!(state.phase, Phase::Idle);
        // Idle states don't move
        assert!(state.tick().is_none());

        state.phase = Phase::Animating;
        let update = state.tick().unwrap();
        assert_eq!(update.index, 1);
        assert!(update.heading_degrees.abs() < 1e-6);
        assert!(state.tick().is_some());
        assert!(state.tick().is_none());
        assert_eq!(state.phase, Phase::Finished);
        assert_eq!(state.current_index, 2);
        assert_eq!(state.current_position, route(3).points()[2]);
    }

    #[test]
    fn invalid_points() {
        let bad = Arc::new(RoutePolyline::new(vec![
            LatLng::new(f64::NAN, 1.0),
            LatLng::new(1.0, f64::INFINITY),
        ]));
        assert!(matches!(
            AnimationState::new(AssetId::new("t"), bad),
            Err(EngineError::InvalidGeometry(_))
        ));
        assert!(AnimationState::new(AssetId::new("t"), Arc::new(RoutePolyline::new(Vec::new())))
            .is_err());

        let partly_bad = Arc::new(RoutePolyline::new(vec![
            LatLng::new(f64::NAN, 1.0),
            LatLng::new(1.0, 1.0),
            LatLng::new(2.0, 1.0),
        ]));
        let state = AnimationState::new(AssetId::new("t"), partly_bad).unwrap();
        assert_eq!(state.points.len(), 2);
        assert_eq!(state.current_position, LatLng::new(1.0, 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn one_point_per_tick() {
        let scheduler = RouteAnimationScheduler::new(&AnimationConfig::default());
        let (tx, mut rx) = unbounded();
        scheduler.subscribe(Arc::new(tx));
        let truck = AssetId::new("truck");
        let points = route(5);

        scheduler.start(&truck, points.clone()).unwrap();
        let state = scheduler.snapshot(&truck).unwrap();
        assert_eq!(state.current_index, 0);
        assert_eq!(state.current_position, points.points()[0]);
        assert!(state.is_animating());

        // Two ticks, at 60ms and 120ms
        tokio::time::sleep(Duration::from_millis(150)).await;
        let state = scheduler.snapshot(&truck).unwrap();
        assert_eq!(state.current_index, 2);
        assert_eq!(state.current_position, points.points()[2]);

        // Plenty of time to reach the end
        tokio::time::sleep(Duration::from_secs(5)).await;
        let state = scheduler.snapshot(&truck).unwrap();
        assert_eq!(state.current_index, 4);
        assert_eq!(state.current_position, points.points()[4]);
        assert_eq!(state.phase, Phase::Finished);
        assert!(!scheduler.is_animating(&truck));

        let indices: Vec<usize> = std::iter::from_fn(|| rx.try_next().ok().flatten())
            .map(|update| update.index)
            .collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_immediate() {
        let scheduler = RouteAnimationScheduler::new(&AnimationConfig::default());
        let (tx, mut rx) = unbounded();
        scheduler.subscribe(Arc::new(tx));
        let truck = AssetId::new("truck");

        // Stopping something that never started is fine
        scheduler.stop(&truck);

        scheduler.start(&truck, route(100)).unwrap();
        tokio::time::sleep(Duration::from_millis(130)).await;
        scheduler.stop(&truck);
        let stopped_at = scheduler.snapshot(&truck).unwrap();
        assert_eq!(stopped_at.current_index, 2);
        assert_eq!(stopped_at.phase, Phase::Idle);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(scheduler.snapshot(&truck).unwrap().current_index, 2);
        let count = std::iter::from_fn(|| rx.try_next().ok().flatten()).count();
        assert_eq!(count, 2);

        scheduler.reset(&truck).unwrap();
        let state = scheduler.snapshot(&truck).unwrap();
        assert_eq!(state.current_index, 0);
        assert_eq!(state.current_position, route(100).points()[0]);
        assert!(matches!(
            scheduler.reset(&AssetId::new("nobody")),
            Err(EngineError::UnknownAsset(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reroute_restarts() {
        let scheduler = RouteAnimationScheduler::new(&AnimationConfig::default());
        let truck = AssetId::new("truck");
        scheduler.start(&truck, route(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.snapshot(&truck).unwrap().current_index, 3);

        let detour = Arc::new(RoutePolyline::new(vec![
            LatLng::new(0.0, 0.0),
            LatLng::new(0.0, 0.001),
            LatLng::new(0.0, 0.002),
        ]));
        scheduler.start(&truck, detour.clone()).unwrap();
        let state = scheduler.snapshot(&truck).unwrap();
        assert_eq!(state.current_index, 0);
        assert_eq!(state.current_position, detour.points()[0]);

        tokio::time::sleep(Duration::from_millis(70)).await;
        let state = scheduler.snapshot(&truck).unwrap();
        assert_eq!(state.current_index, 1);
        assert!((state.heading_degrees - 90.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn assets_are_independent() {
        let scheduler = RouteAnimationScheduler::new(&AnimationConfig::default());
        let a = AssetId::new("a");
        let b = AssetId::new("b");
        scheduler.start(&a, route(50)).unwrap();
        tokio::time::sleep(Duration::from_millis(130)).await;
        scheduler.start(&b, route(50)).unwrap();
        tokio::time::sleep(Duration::from_millis(130)).await;
        scheduler.stop(&a);
        tokio::time::sleep(Duration::from_millis(130)).await;

        assert_eq!(scheduler.snapshot(&a).unwrap().current_index, 4);
        assert_eq!(scheduler.snapshot(&b).unwrap().current_index, 4);
        assert_eq!(scheduler.animating_assets(), vec![b.clone()]);

        // A route with nothing usable doesn't start, and doesn't disturb anything else
        let bad = Arc::new(RoutePolyline::new(vec![LatLng::new(f64::NAN, 0.0)]));
        assert!(scheduler.start(&AssetId::new("c"), bad).is_err());
        assert!(scheduler.snapshot(&AssetId::new("c")).is_none());
        assert!(scheduler.is_animating(&b));
    }
}
