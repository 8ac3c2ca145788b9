//! Zone controller: owns the zone outputs and the master safety relay.
//!
//! Invariants held after every public call returns:
//! - a zone output is energized iff the zone is in the active set;
//! - the safety relay is energized iff the active set is non-empty;
//! - the active set never grows past `max_active_zones`.
//!
//! Each activation owns a single-shot auto-off timer task. Timers carry a
//! generation number so a timer belonging to a replaced activation can never
//! switch off the activation that replaced it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{HardwareError, ZoneError};
use crate::output::OutputBoard;
use crate::run_state::RunStateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneConfig {
    pub id: u8,
    pub pin: u8,
    pub name: String,
    pub visible: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ZoneLimits {
    pub max_active_zones: usize,
    pub max_zone_duration_min: u32,
}

/// Who is asking for a zone to start. Manual requests are refused while a
/// program owns the system; the program executor is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Manual,
    Program,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneStatus {
    pub id: u8,
    pub name: String,
    pub active: bool,
    pub remaining_seconds: u64,
}

struct Activation {
    started: Instant,
    duration_min: u32,
    generation: u64,
    timer: JoinHandle<()>,
}

struct Outputs {
    board: Box<dyn OutputBoard>,
    zones: BTreeMap<u8, ZoneConfig>,
    relay_pin: Option<u8>,
    active: HashMap<u8, Activation>,
    next_generation: u64,
}

impl Outputs {
    fn set_relay(&mut self, on: bool) -> Result<(), HardwareError> {
        let Some(pin) = self.relay_pin else {
            return Ok(());
        };
        match self.board.write(pin, on) {
            Ok(()) => {
                info!(on, "safety relay {}", if on { "energized" } else { "released" });
                Ok(())
            }
            Err(e) => {
                error!(on, "safety relay write failed: {e}");
                Err(e)
            }
        }
    }

    /// Switch a zone off. The output write is the ground truth: bookkeeping
    /// is only cleared once the write succeeded, and a zone that was not in
    /// the active set is still written off.
    fn switch_off(&mut self, zone_id: u8, pin: u8) -> Result<(), HardwareError> {
        if let Err(e) = self.board.write(pin, false) {
            error!(zone = zone_id, "failed to switch zone off: {e}");
            return Err(e);
        }
        if let Some(activation) = self.active.remove(&zone_id) {
            activation.timer.abort();
            info!(zone = zone_id, "zone stopped");
        }
        if self.active.is_empty() {
            self.set_relay(false)?;
        }
        Ok(())
    }
}

/// Cheap to clone; every clone drives the same outputs.
#[derive(Clone)]
pub struct ZoneController {
    outputs: Arc<Mutex<Outputs>>,
    limits: ZoneLimits,
    run_state: Arc<RunStateStore>,
}

impl ZoneController {
    pub fn new(
        board: impl OutputBoard,
        limits: ZoneLimits,
        run_state: Arc<RunStateStore>,
    ) -> Self {
        Self {
            outputs: Arc::new(Mutex::new(Outputs {
                board: Box::new(board),
                zones: BTreeMap::new(),
                relay_pin: None,
                active: HashMap::new(),
                next_generation: 0,
            })),
            limits,
            run_state,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Outputs> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limits(&self) -> ZoneLimits {
        self.limits
    }

    /// Bind every configured zone and the safety relay, leaving all outputs
    /// de-energized. Returns false when not a single zone could be bound;
    /// individual failures are logged and skipped.
    pub fn initialize(&self, zones: &[ZoneConfig], relay_pin: Option<u8>) -> bool {
        let mut outputs = self.lock();
        let mut failed = Vec::new();

        for zone in zones {
            match outputs.board.bind(zone.pin) {
                Ok(()) => {
                    outputs.zones.insert(zone.id, zone.clone());
                }
                Err(e) => failed.push(format!("zone {}: {e}", zone.id)),
            }
        }
        if !failed.is_empty() {
            error!("zone pin initialisation errors: {}", failed.join(", "));
        }

        outputs.relay_pin = None;
        if let Some(pin) = relay_pin {
            match outputs.board.bind(pin) {
                Ok(()) => {
                    outputs.relay_pin = Some(pin);
                    info!(pin, "safety relay bound");
                }
                Err(e) => error!("safety relay initialisation failed: {e}"),
            }
        }

        info!(zones = outputs.zones.len(), "zone outputs initialised");
        !outputs.zones.is_empty()
    }

    /// Energize a zone for `minutes`.
    ///
    /// Re-starting a zone that is already active replaces its timer, so the
    /// remaining time restarts from `minutes`. Must be called from within a
    /// Tokio runtime; the auto-off timer is a spawned task.
    pub fn start(&self, zone_id: u8, minutes: u32, origin: Origin) -> Result<(), ZoneError> {
        if origin == Origin::Manual && self.run_state.load().program_running {
            warn!(zone = zone_id, "manual start refused: program running");
            return Err(ZoneError::ProgramOwnsSystem);
        }

        let mut outputs = self.lock();
        let Some(pin) = outputs.zones.get(&zone_id).map(|z| z.pin) else {
            return Err(ZoneError::NotFound(zone_id));
        };

        let max = self.limits.max_zone_duration_min;
        if minutes == 0 || minutes > max {
            return Err(ZoneError::InvalidDuration { minutes, max });
        }

        let already_active = outputs.active.contains_key(&zone_id);
        if !already_active && outputs.active.len() >= self.limits.max_active_zones {
            warn!(
                zone = zone_id,
                max = self.limits.max_active_zones,
                "active zone limit reached"
            );
            return Err(ZoneError::CapacityExceeded {
                max: self.limits.max_active_zones,
            });
        }

        let first_active = outputs.active.is_empty();
        if first_active {
            outputs.set_relay(true)?;
        }

        if let Err(e) = outputs.board.write(pin, true) {
            error!(zone = zone_id, "failed to switch zone on: {e}");
            if first_active {
                let _ = outputs.set_relay(false);
            }
            return Err(e.into());
        }

        if let Some(previous) = outputs.active.remove(&zone_id) {
            previous.timer.abort();
        }

        let generation = outputs.next_generation;
        outputs.next_generation += 1;
        let timer = tokio::spawn(self.clone().auto_off(
            zone_id,
            generation,
            Duration::from_secs(u64::from(minutes) * 60),
        ));
        outputs.active.insert(
            zone_id,
            Activation {
                started: Instant::now(),
                duration_min: minutes,
                generation,
                timer,
            },
        );

        info!(zone = zone_id, minutes, ?origin, "zone started");
        Ok(())
    }

    async fn auto_off(self, zone_id: u8, generation: u64, after: Duration) {
        tokio::time::sleep(after).await;

        let mut outputs = self.lock();
        let current = outputs
            .active
            .get(&zone_id)
            .is_some_and(|a| a.generation == generation);
        if !current {
            return;
        }
        let Some(pin) = outputs.zones.get(&zone_id).map(|z| z.pin) else {
            return;
        };
        if outputs.switch_off(zone_id, pin).is_ok() {
            info!(zone = zone_id, "zone timer expired");
        }
    }

    /// De-energize a zone. Idempotent: stopping an inactive zone still
    /// writes its output off.
    pub fn stop(&self, zone_id: u8) -> Result<(), ZoneError> {
        let mut outputs = self.lock();
        let Some(pin) = outputs.zones.get(&zone_id).map(|z| z.pin) else {
            return Err(ZoneError::NotFound(zone_id));
        };
        outputs.switch_off(zone_id, pin)?;
        Ok(())
    }

    /// Stop everything, best-effort.
    ///
    /// Stops each active zone, then writes every configured output and the
    /// relay off regardless of bookkeeping, then clears the active set.
    pub fn stop_all(&self) {
        let mut outputs = self.lock();

        let active: Vec<u8> = outputs.active.keys().copied().collect();
        let mut failures = 0;
        for zone_id in active {
            let Some(pin) = outputs.zones.get(&zone_id).map(|z| z.pin) else {
                continue;
            };
            if outputs.switch_off(zone_id, pin).is_err() {
                failures += 1;
            }
        }

        if failures > 0 {
            warn!(failures, "forcing remaining zones off");
        }
        let pins: Vec<(u8, u8)> = outputs.zones.values().map(|z| (z.id, z.pin)).collect();
        for (zone_id, pin) in pins {
            if let Err(e) = outputs.board.write(pin, false) {
                error!(zone = zone_id, "forced switch-off failed: {e}");
            }
        }
        for (_, activation) in outputs.active.drain() {
            activation.timer.abort();
        }
        let _ = outputs.set_relay(false);
    }

    /// Status of every visible zone, in id order.
    pub fn status(&self) -> Vec<ZoneStatus> {
        let outputs = self.lock();
        let now = Instant::now();

        outputs
            .zones
            .values()
            .filter(|z| z.visible)
            .map(|z| {
                let activation = outputs.active.get(&z.id);
                let remaining_seconds = activation.map_or(0, |a| {
                    let total = u64::from(a.duration_min) * 60;
                    total.saturating_sub(now.duration_since(a.started).as_secs())
                });
                ZoneStatus {
                    id: z.id,
                    name: z.name.clone(),
                    active: activation.is_some(),
                    remaining_seconds,
                }
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_active(&self, zone_id: u8) -> bool {
        self.lock().active.contains_key(&zone_id)
    }

    pub fn is_configured(&self, zone_id: u8) -> bool {
        self.lock().zones.contains_key(&zone_id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MockBoard;
    use crate::run_state::RunState;
    use tempfile::TempDir;

    const RELAY: u8 = 13;

    struct Rig {
        _dir: TempDir,
        board: MockBoard,
        run_state: Arc<RunStateStore>,
        zones: ZoneController,
    }

    fn zone(id: u8, pin: u8, visible: bool) -> ZoneConfig {
        ZoneConfig {
            id,
            pin,
            name: format!("Zone {id}"),
            visible,
        }
    }

    fn rig() -> Rig {
        let dir = TempDir::new().unwrap();
        let board = MockBoard::new();
        let run_state = Arc::new(RunStateStore::open(dir.path()));
        let zones = ZoneController::new(
            board.clone(),
            ZoneLimits {
                max_active_zones: 2,
                max_zone_duration_min: 30,
            },
            Arc::clone(&run_state),
        );
        assert!(zones.initialize(
            &[zone(0, 14, true), zone(1, 15, true), zone(2, 16, false)],
            Some(RELAY),
        ));
        Rig {
            _dir: dir,
            board,
            run_state,
            zones,
        }
    }

    /// Relay energized iff at least one zone is active.
    fn assert_interlock(rig: &Rig) {
        assert_eq!(
            rig.board.is_on(RELAY),
            rig.zones.active_count() > 0,
            "relay out of sync with active zones"
        );
    }

    // -- initialize ---------------------------------------------------------

    #[test]
    fn initialize_fails_when_no_zone_binds() {
        let dir = TempDir::new().unwrap();
        let board = MockBoard::new();
        board.refuse_bind(14);
        let zones = ZoneController::new(
            board.clone(),
            ZoneLimits {
                max_active_zones: 1,
                max_zone_duration_min: 10,
            },
            Arc::new(RunStateStore::open(dir.path())),
        );
        assert!(!zones.initialize(&[zone(0, 14, true)], None));
        assert!(!zones.is_configured(0));

        // Still usable with nothing bound.
        assert!(matches!(
            zones.start(0, 5, Origin::Manual),
            Err(ZoneError::NotFound(0))
        ));
        zones.stop_all();
        assert!(zones.status().is_empty());
        assert_eq!(zones.active_count(), 0);
        assert!(board.energized_pins().is_empty());
    }

    #[test]
    fn initialize_skips_unbindable_zones() {
        let dir = TempDir::new().unwrap();
        let board = MockBoard::new();
        board.refuse_bind(15);
        let zones = ZoneController::new(
            board.clone(),
            ZoneLimits {
                max_active_zones: 1,
                max_zone_duration_min: 10,
            },
            Arc::new(RunStateStore::open(dir.path())),
        );
        assert!(zones.initialize(&[zone(0, 14, true), zone(1, 15, true)], Some(RELAY)));
        assert!(zones.is_configured(0));
        assert!(!zones.is_configured(1));
        assert!(board.energized_pins().is_empty());
    }

    // -- start --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn start_energizes_relay_and_zone() {
        let rig = rig();
        rig.zones.start(0, 5, Origin::Manual).unwrap();
        assert_eq!(rig.board.energized_pins(), vec![RELAY, 14]);
        assert!(rig.zones.is_active(0));
        assert_interlock(&rig);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_zone_is_not_found_and_touches_nothing() {
        let rig = rig();
        let writes = rig.board.write_count();
        assert_eq!(
            rig.zones.start(42, 5, Origin::Manual),
            Err(ZoneError::NotFound(42))
        );
        assert_eq!(rig.zones.stop(42), Err(ZoneError::NotFound(42)));
        assert_eq!(rig.board.write_count(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_outside_bounds_rejected() {
        let rig = rig();
        assert_eq!(
            rig.zones.start(0, 0, Origin::Manual),
            Err(ZoneError::InvalidDuration { minutes: 0, max: 30 })
        );
        assert_eq!(
            rig.zones.start(0, 31, Origin::Manual),
            Err(ZoneError::InvalidDuration { minutes: 31, max: 30 })
        );
        rig.zones.start(0, 30, Origin::Manual).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_limit_enforced() {
        let rig = rig();
        rig.zones.start(0, 5, Origin::Manual).unwrap();
        rig.zones.start(1, 5, Origin::Manual).unwrap();
        assert_eq!(
            rig.zones.start(2, 5, Origin::Manual),
            Err(ZoneError::CapacityExceeded { max: 2 })
        );
        assert_eq!(rig.zones.active_count(), 2);
        assert!(!rig.board.is_on(16));
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_active_zone_allowed_at_capacity() {
        let rig = rig();
        rig.zones.start(0, 5, Origin::Manual).unwrap();
        rig.zones.start(1, 5, Origin::Manual).unwrap();
        rig.zones.start(1, 10, Origin::Manual).unwrap();
        assert_eq!(rig.zones.active_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_start_refused_while_program_runs() {
        let rig = rig();
        rig.run_state.save(&RunState::running("1")).unwrap();
        assert_eq!(
            rig.zones.start(0, 5, Origin::Manual),
            Err(ZoneError::ProgramOwnsSystem)
        );
        rig.zones.start(0, 5, Origin::Program).unwrap();
        assert!(rig.zones.is_active(0));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_zone_write_releases_relay() {
        let rig = rig();
        rig.board.fail_next_writes(14, 1);
        let err = rig.zones.start(0, 5, Origin::Manual).unwrap_err();
        assert!(matches!(err, ZoneError::HardwareFault(_)));
        assert_eq!(rig.zones.active_count(), 0);
        assert!(!rig.board.is_on(RELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_relay_write_refuses_start() {
        let rig = rig();
        rig.board.fail_next_writes(RELAY, 1);
        let err = rig.zones.start(0, 5, Origin::Manual).unwrap_err();
        assert!(matches!(err, ZoneError::HardwareFault(_)));
        assert!(!rig.board.is_on(14));
        assert_eq!(rig.zones.active_count(), 0);
    }

    // -- stop ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let rig = rig();
        rig.zones.start(0, 5, Origin::Manual).unwrap();
        rig.zones.stop(0).unwrap();
        let after_first = (rig.board.energized_pins(), rig.zones.status());
        rig.zones.stop(0).unwrap();
        assert_eq!((rig.board.energized_pins(), rig.zones.status()), after_first);
        assert_interlock(&rig);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_stays_on_until_last_zone_stops() {
        let rig = rig();
        rig.zones.start(0, 5, Origin::Manual).unwrap();
        rig.zones.start(1, 5, Origin::Manual).unwrap();
        rig.zones.stop(0).unwrap();
        assert!(rig.board.is_on(RELAY));
        assert_interlock(&rig);
        rig.zones.stop(1).unwrap();
        assert!(!rig.board.is_on(RELAY));
        assert_interlock(&rig);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_keeps_zone_tracked() {
        let rig = rig();
        rig.zones.start(0, 5, Origin::Manual).unwrap();
        rig.board.fail_next_writes(14, 1);
        assert!(matches!(rig.zones.stop(0), Err(ZoneError::HardwareFault(_))));
        assert!(rig.zones.is_active(0));
        assert_interlock(&rig);
    }

    // -- timers -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timer_switches_zone_off() {
        let rig = rig();
        rig.zones.start(0, 1, Origin::Manual).unwrap();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(rig.zones.is_active(0));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!rig.zones.is_active(0));
        assert!(rig.board.energized_pins().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_timer() {
        let rig = rig();
        rig.zones.start(0, 1, Origin::Manual).unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        rig.zones.start(0, 1, Origin::Manual).unwrap();

        // The first timer would have fired at t=60.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rig.zones.is_active(0));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!rig.zones.is_active(0));
        assert_interlock(&rig);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_after_manual_stop_is_harmless() {
        let rig = rig();
        rig.zones.start(0, 1, Origin::Manual).unwrap();
        rig.zones.stop(0).unwrap();
        rig.zones.start(1, 5, Origin::Manual).unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(rig.zones.is_active(1));
        assert_interlock(&rig);
    }

    // -- stop_all -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stop_all_clears_everything() {
        let rig = rig();
        rig.zones.start(0, 5, Origin::Manual).unwrap();
        rig.zones.start(2, 5, Origin::Manual).unwrap();
        rig.zones.stop_all();
        assert_eq!(rig.zones.active_count(), 0);
        assert!(rig.board.energized_pins().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_forces_off_when_individual_stops_fail() {
        let rig = rig();
        rig.zones.start(0, 5, Origin::Manual).unwrap();
        rig.zones.start(1, 5, Origin::Manual).unwrap();
        rig.board.fail_next_writes(14, 1);
        rig.board.fail_next_writes(15, 1);

        rig.zones.stop_all();

        assert_eq!(rig.zones.active_count(), 0);
        assert!(rig.board.energized_pins().is_empty());
        assert_interlock(&rig);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_with_nothing_active_is_fine() {
        let rig = rig();
        rig.zones.stop_all();
        assert_eq!(rig.zones.active_count(), 0);
        assert_interlock(&rig);
    }

    // -- status -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn status_lists_visible_zones_with_remaining_time() {
        let rig = rig();
        rig.zones.start(1, 2, Origin::Manual).unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;

        let status = rig.zones.status();
        assert_eq!(status.len(), 2, "hidden zone 2 must be omitted");
        assert_eq!(status[0].id, 0);
        assert!(!status[0].active);
        assert_eq!(status[0].remaining_seconds, 0);
        assert_eq!(status[1].id, 1);
        assert!(status[1].active);
        assert_eq!(status[1].remaining_seconds, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_zone_still_counts_as_active() {
        let rig = rig();
        rig.zones.start(2, 2, Origin::Manual).unwrap();
        assert_eq!(rig.zones.active_count(), 1);
        assert!(rig.zones.status().iter().all(|z| !z.active));
    }
}
