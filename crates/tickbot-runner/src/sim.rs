//! A toy host for exercising the runtime without a game attached.
//!
//! One character walks along a line between waypoints and occasionally dies.
//! The demo bot idles, asks a worker thread to plan a route, travels, and lets
//! a death recovery take over whenever the character is down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tickbot_cache::{CacheNamespace, CacheView, view_as};
use tickbot_events::{EventConsumer, dispatch_pending};
use tickbot_fsm::{BotBuilder, BotScript, BotState, OnTimeout, Program, RecoveryPolicy};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::driver::HostDriver;

pub const PLAYER: &str = "player";
pub const MAP: &str = "map";

const WAYPOINTS: [i64; 5] = [-120, -40, 0, 55, 140];
const RESPAWN_FRAMES: u32 = 45;
const WALK_SPEED: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSnapshot {
    pub position: i64,
    pub destination: Option<i64>,
    pub dead: bool,
    pub deaths: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSnapshot {
    pub waypoints: Vec<i64>,
}

pub struct SimWorld {
    rng: StdRng,
    death_chance: f64,
    position: i64,
    destination: Option<i64>,
    respawn_in: Option<u32>,
    deaths: u32,
}

pub type SharedWorld = Arc<Mutex<SimWorld>>;

/// Parse a per-frame probability, rejecting NaN and anything outside `0..=1`
pub fn parse_chance(value: &str) -> Result<f64, String> {
    let chance: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("'{}' is not a number: {}", value, e))?;
    if !(0.0..=1.0).contains(&chance) {
        return Err(format!("'{}' must be between 0 and 1", value));
    }
    Ok(chance)
}

impl SimWorld {
    /// A `death_chance` that is not a usable probability is treated as zero
    pub fn new(seed: u64, death_chance: f64) -> Self {
        let death_chance = if death_chance.is_finite() {
            death_chance.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            rng: StdRng::seed_from_u64(seed),
            death_chance,
            position: 0,
            destination: None,
            respawn_in: None,
            deaths: 0,
        }
    }

    pub fn shared(self) -> SharedWorld {
        Arc::new(Mutex::new(self))
    }

    /// Advance the world by one frame
    pub fn step(&mut self) {
        if let Some(frames) = self.respawn_in {
            if frames <= 1 {
                self.respawn_in = None;
                self.position = 0;
                debug!(target: "runner", "Character respawned");
            } else {
                self.respawn_in = Some(frames - 1);
            }
            return;
        }

        if self.rng.gen_bool(self.death_chance) {
            self.kill();
            return;
        }

        if let Some(destination) = self.destination {
            let delta = (destination - self.position).clamp(-WALK_SPEED, WALK_SPEED);
            self.position += delta;
            if self.position == destination {
                self.destination = None;
            }
        }
    }

    pub fn kill(&mut self) {
        if self.respawn_in.is_none() {
            self.respawn_in = Some(RESPAWN_FRAMES);
            self.destination = None;
            self.deaths += 1;
            info!(target: "runner", "Character died at {}", self.position);
        }
    }

    /// Ignored while dead
    pub fn travel_to(&mut self, destination: i64) {
        if self.respawn_in.is_none() {
            self.destination = Some(destination);
        }
    }

    pub fn player(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            position: self.position,
            destination: self.destination,
            dead: self.respawn_in.is_some(),
            deaths: self.deaths,
        }
    }
}

fn lock(world: &SharedWorld) -> MutexGuard<'_, SimWorld> {
    world.lock().unwrap_or_else(PoisonError::into_inner)
}

fn player(cache: &dyn CacheView) -> anyhow::Result<Arc<PlayerSnapshot>> {
    Ok(view_as::<PlayerSnapshot>(cache, PLAYER)?)
}

/// Cache namespaces over the simulated world
pub fn namespaces(world: &SharedWorld) -> Vec<CacheNamespace> {
    let source = world.clone();
    vec![
        CacheNamespace::from_fn(PLAYER, 1, move || Ok(lock(&source).player())),
        CacheNamespace::from_fn(MAP, 30, || {
            Ok(MapSnapshot {
                waypoints: WAYPOINTS.to_vec(),
            })
        }),
    ]
}

/// Idle -> Travel -> Idle with a death recovery
pub fn demo_bot(name: &str, world: &SharedWorld) -> BotBuilder {
    let planned = Arc::new(Mutex::new(None::<i64>));

    let planner_output = planned.clone();
    let travel_input = planned;
    let commands = world.clone();
    let planner = format!("{}-route-planner", name);

    let idle = BotState::builder("Idle")
        .step(
            Program::new()
                .spawn(planner.clone(), move |token| {
                    token.keepalive();
                    // Pretend path finding takes a while
                    if token.sleep(Duration::from_millis(20)) {
                        return Ok(());
                    }
                    let destination = WAYPOINTS.choose(&mut rand::thread_rng()).copied();
                    *planner_output
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = destination;
                    Ok(())
                })
                .await_worker(planner, Some(300), OnTimeout::Fail)
                .run(move |ctx| {
                    let destination = travel_input
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take()
                        .ok_or_else(|| anyhow::anyhow!("route planner produced no destination"))?;
                    let map = ctx.read_as::<MapSnapshot>(MAP)?;
                    anyhow::ensure!(
                        map.waypoints.contains(&destination),
                        "{} is not a known waypoint",
                        destination
                    );
                    info!(target: "runner", bot = ctx.bot(), "Heading to {}", destination);
                    lock(&commands).travel_to(destination);
                    Ok(())
                })
                .wait_ticks(1),
        )
        .then("Travel")
        .build();

    let travel = BotState::builder("Travel")
        .step(Program::new().wait_until_or(
            |cache| {
                let player = player(cache)?;
                Ok(!player.dead && player.destination.is_none())
            },
            600,
            OnTimeout::Goto("Idle".to_string()),
        ))
        .on_exit(|ctx| {
            let player = player(ctx.cache())?;
            debug!(target: "runner", bot = ctx.bot(), "Stopped at {}", player.position);
            Ok(())
        })
        .then("Idle")
        .build();

    let death = RecoveryPolicy::builder("death")
        .trigger(|cache| Ok(player(cache)?.dead))
        .wait_until(|cache| Ok(!player(cache)?.dead), None)
        .run(|ctx| {
            info!(target: "runner", bot = ctx.bot(), "Back on our feet");
            Ok(())
        })
        .jump_to("Idle");

    BotScript::builder(name).state(idle).state(travel).recovery(death)
}

/// How a simulation run ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub failed_frames: u64,
    pub interrupted: bool,
}

/// Drive `driver` and `world` at `fps` until `frames` have run or Ctrl+C.
///
/// Events are handed to `consumers` after every frame; unresponsive workers
/// are checked about once a second.
pub async fn run(
    driver: &mut HostDriver,
    world: &SharedWorld,
    consumers: &mut [Box<dyn EventConsumer>],
    fps: u32,
    frames: Option<u64>,
) -> RunSummary {
    let fps = fps.max(1);
    let mut events = driver.subscribe();
    let mut interval = tokio::time::interval(Duration::from_secs(1) / fps);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut summary = RunSummary::default();
    while frames.is_none_or(|limit| summary.frames < limit) {
        tokio::select! {
            _ = interval.tick() => {
                lock(world).step();
                let report = driver.on_frame();
                summary.frames += 1;
                if !report.is_ok() {
                    summary.failed_frames += 1;
                }
                if report.tick % u64::from(fps) == 0 {
                    driver.check_workers();
                }
                dispatch_pending(&mut events, consumers);
            }
            _ = &mut ctrl_c => {
                info!(target: "runner", "Interrupted after {} frame(s)", summary.frames);
                summary.interrupted = true;
                break;
            }
        }
    }

    dispatch_pending(&mut events, consumers);
    summary
}
