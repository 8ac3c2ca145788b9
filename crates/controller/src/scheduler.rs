//! Program executor and automatic scheduling.
//!
//! At most one program owns the system at a time. Ownership is recorded in
//! the run-state store: claimed before the first zone starts, released
//! after the last zone stops. Release and a forced `stop_all` live in a drop
//! guard, so they run however the execution ends.
//!
//! ## Execution state machine
//!
//! ```text
//! Idle ──▶ Claiming ──▶ Running(step i) ──▶ Completed ──┐
//!                              │                         │
//!                              ├──▶ Interrupted ─────────┼──▶ Idle
//!                              └──▶ Failed ──────────────┘
//! ```
//!
//! Cancellation is cooperative: step waits wake on an explicit stop signal
//! and re-check the run state every `poll_interval`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ControllerSettings;
use crate::error::{ExecuteError, ProgramError, StoreError};
use crate::program::{CalendarDate, ClockTime, Program, ProgramDraft};
use crate::programs::ProgramStore;
use crate::run_state::{RunState, RunStateStore};
use crate::schedule;
use crate::zones::{Origin, ZoneController, ZoneStatus};

/// How often the supervisor runs the due check.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive due-check failures before the supervisor forces a reset.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// A failure arriving after this long starts a fresh count.
const FAILURE_WINDOW: Duration = Duration::from_secs(3600);

const ESCALATION_BACKOFF: Duration = Duration::from_secs(10);

/// Write attempts when claiming or releasing the run state.
const PERSIST_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Pause between consecutive steps.
    pub activation_delay: Duration,
    /// Upper bound on how long a step wait goes without re-reading the run
    /// state.
    pub poll_interval: Duration,
    /// Pause after preempting a program, before starting the next one.
    pub settle_delay: Duration,
    pub persist_backoff: Duration,
    pub automatic_enabled: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            activation_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            persist_backoff: Duration::from_millis(200),
            automatic_enabled: true,
        }
    }
}

impl From<&ControllerSettings> for SchedulerSettings {
    fn from(c: &ControllerSettings) -> Self {
        Self {
            activation_delay: Duration::from_secs(c.activation_delay_sec),
            automatic_enabled: c.automatic_programs_enabled,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub program_running: bool,
    pub current_program_id: Option<String>,
    /// The zone a running program is watering right now.
    pub active_zone: Option<ZoneStatus>,
}

// ---------------------------------------------------------------------------
// Active run bookkeeping
// ---------------------------------------------------------------------------

struct ActiveRun {
    serial: u64,
    program_id: String,
    stop: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
}

impl ActiveRun {
    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }
}

struct Inner {
    zones: ZoneController,
    run_state: Arc<RunStateStore>,
    programs: ProgramStore,
    settings: SchedulerSettings,
    active: Mutex<Option<ActiveRun>>,
    next_serial: AtomicU64,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cleanup for one execution: zones off first, then the run state
/// released, then waiters notified. When another program already owns the
/// run state its zones and record are left alone.
struct RunGuard {
    inner: Arc<Inner>,
    serial: u64,
    program_id: String,
    finished: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let state = self.inner.run_state.current();
        let claimed_elsewhere = state.program_running
            && state
                .current_program_id
                .as_deref()
                .is_some_and(|id| id != self.program_id);
        if claimed_elsewhere {
            warn!(
                program = %self.program_id,
                owner = ?state.current_program_id,
                "run state owned by another program; leaving outputs and record"
            );
        } else {
            self.inner.zones.stop_all();
            if let Err(e) = self.inner.run_state.save(&RunState::idle()) {
                error!(program = %self.program_id, "failed to release run state: {e}");
            }
        }

        {
            let mut active = self.inner.active();
            if active.as_ref().is_some_and(|run| run.serial == self.serial) {
                *active = None;
            }
        }
        self.finished.send_replace(true);
        debug!(program = %self.program_id, "execution cleaned up");
    }
}

// ---------------------------------------------------------------------------
// Persistence with bounded retry
// ---------------------------------------------------------------------------

enum PersistStep {
    Write,
    Verify,
    Retry,
    ProceedAnyway,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share the same execution slot.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        zones: ZoneController,
        run_state: Arc<RunStateStore>,
        programs: ProgramStore,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                zones,
                run_state,
                programs,
                settings,
                active: Mutex::new(None),
                next_serial: AtomicU64::new(0),
            }),
        }
    }

    pub fn zones(&self) -> &ZoneController {
        &self.inner.zones
    }

    pub fn programs(&self) -> &ProgramStore {
        &self.inner.programs
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    // -- execution ----------------------------------------------------------

    /// Run `program` to completion, interruption or failure.
    ///
    /// Refused with `AlreadyRunning` before any output is touched when
    /// another program owns the system. The last run date advances only
    /// when every step ran to its end.
    pub async fn execute(
        &self,
        program: Program,
        manual: bool,
    ) -> Result<RunOutcome, ExecuteError> {
        if program.steps.is_empty() {
            return Err(ExecuteError::InvalidSteps);
        }
        self.wait_for_stopping_run().await;

        let (_guard, mut stop) = self.register(&program.id)?;

        if self.inner.zones.active_count() > 0 {
            info!(
                program = %program.id,
                active = self.inner.zones.active_count(),
                "stopping manually started zones"
            );
            self.inner.zones.stop_all();
        }

        if !self.persist(&RunState::running(&program.id)).await {
            warn!(program = %program.id, "run state claim unconfirmed, continuing");
        }
        info!(
            program = %program.id,
            name = %program.name,
            steps = program.steps.len(),
            manual,
            "program started"
        );

        let total = program.steps.len();
        let mut failed = 0;
        for (i, step) in program.steps.iter().enumerate() {
            if self.interrupted(&program.id, &stop) {
                info!(program = %program.id, step = i + 1, "program interrupted");
                return Ok(RunOutcome::Interrupted);
            }

            info!(
                program = %program.id,
                step = i + 1,
                of = total,
                zone = step.zone_id,
                minutes = step.duration_min,
                "step started"
            );
            if let Err(e) = self
                .inner
                .zones
                .start(step.zone_id, step.duration_min, Origin::Program)
            {
                error!(program = %program.id, zone = step.zone_id, "step skipped: {e}");
                failed += 1;
                continue;
            }

            let ran = self
                .hold(&program.id, &mut stop, minutes(step.duration_min))
                .await;
            if let Err(e) = self.inner.zones.stop(step.zone_id) {
                error!(program = %program.id, zone = step.zone_id, "failed to stop step zone: {e}");
            }
            if !ran {
                info!(program = %program.id, step = i + 1, "program interrupted");
                return Ok(RunOutcome::Interrupted);
            }

            let delay = self.inner.settings.activation_delay;
            let more = i + 1 < total && !delay.is_zero();
            if more && !self.hold(&program.id, &mut stop, delay).await {
                info!(program = %program.id, step = i + 1, "program interrupted between steps");
                return Ok(RunOutcome::Interrupted);
            }
        }

        if failed > 0 {
            warn!(program = %program.id, failed, "program finished with failed steps");
            return Err(ExecuteError::ZoneFault { failed });
        }
        if self.interrupted(&program.id, &stop) {
            info!(program = %program.id, "program interrupted after last step");
            return Ok(RunOutcome::Interrupted);
        }

        match self.inner.programs.mark_run(&program.id, CalendarDate::today()) {
            Ok(()) => {}
            Err(ProgramError::Storage(e)) => return Err(e.into()),
            Err(e) => warn!(program = %program.id, "could not record last run: {e}"),
        }
        info!(program = %program.id, "program completed");
        Ok(RunOutcome::Completed)
    }

    /// Take the execution slot for `program_id`, or report who holds it.
    fn register(
        &self,
        program_id: &str,
    ) -> Result<(RunGuard, watch::Receiver<bool>), ExecuteError> {
        let mut active = self.inner.active();
        if let Some(run) = active.as_ref() {
            return Err(ExecuteError::AlreadyRunning(run.program_id.clone()));
        }
        let state = self.inner.run_state.load();
        if state.program_running {
            let owner = state.current_program_id.unwrap_or_else(|| "unknown".into());
            return Err(ExecuteError::AlreadyRunning(owner));
        }

        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        *active = Some(ActiveRun {
            serial,
            program_id: program_id.to_string(),
            stop: stop_tx,
            finished: finished_rx,
        });

        let guard = RunGuard {
            inner: Arc::clone(&self.inner),
            serial,
            program_id: program_id.to_string(),
            finished: finished_tx,
        };
        Ok((guard, stop_rx))
    }

    /// Wait out `total`, waking early on a stop signal and re-reading the
    /// run state at least every `poll_interval`. False when interrupted.
    async fn hold(
        &self,
        program_id: &str,
        stop: &mut watch::Receiver<bool>,
        total: Duration,
    ) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.interrupted(program_id, stop) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let nap = (deadline - now).min(self.inner.settings.poll_interval);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = stop.changed() => {}
            }
        }
    }

    fn interrupted(&self, program_id: &str, stop: &watch::Receiver<bool>) -> bool {
        if *stop.borrow() || stop.has_changed().is_err() {
            return true;
        }
        !self.inner.run_state.load().is_owned_by(program_id)
    }

    /// Write → Verify → Retry → ProceedAnyway. True when the record was
    /// confirmed on disk.
    async fn persist(&self, target: &RunState) -> bool {
        let mut attempt = 1;
        let mut step = PersistStep::Write;
        loop {
            step = match step {
                PersistStep::Write => match self.inner.run_state.save(target) {
                    Ok(()) => PersistStep::Verify,
                    Err(e) => {
                        warn!(attempt, "run state write failed: {e}");
                        PersistStep::Retry
                    }
                },
                PersistStep::Verify => {
                    if self.inner.run_state.load() == *target {
                        return true;
                    }
                    warn!(attempt, "run state verification mismatch");
                    PersistStep::Retry
                }
                PersistStep::Retry if attempt < PERSIST_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(self.inner.settings.persist_backoff).await;
                    PersistStep::Write
                }
                PersistStep::Retry => PersistStep::ProceedAnyway,
                PersistStep::ProceedAnyway => {
                    warn!(
                        running = target.program_running,
                        attempts = PERSIST_ATTEMPTS,
                        "run state persistence unconfirmed, proceeding"
                    );
                    return false;
                }
            };
        }
    }

    /// Ask the active run to stop. True if there was one.
    fn signal_stop(&self) -> bool {
        match self.inner.active().as_ref() {
            Some(run) => {
                run.stop.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Give a run that has been asked to stop the chance to clean up.
    async fn wait_for_stopping_run(&self) {
        let finished = self
            .inner
            .active()
            .as_ref()
            .filter(|run| run.stopping())
            .map(|run| run.finished.clone());
        let Some(mut finished) = finished else {
            return;
        };

        let limit = self.inner.settings.poll_interval * 2;
        let in_time = tokio::time::timeout(limit, finished.wait_for(|done| *done))
            .await
            .is_ok();
        if !in_time {
            warn!("previous program did not finish cleaning up in time");
        }
    }

    /// The program that owns the system, ignoring one already stopping.
    fn running_program(&self) -> Option<String> {
        if let Some(run) = self.inner.active().as_ref().filter(|run| !run.stopping()) {
            return Some(run.program_id.clone());
        }
        let state = self.inner.run_state.load();
        state
            .program_running
            .then(|| state.current_program_id.unwrap_or_else(|| "unknown".into()))
    }

    fn spawn_execution(&self, program: Program, manual: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            let id = program.id.clone();
            match this.execute(program, manual).await {
                Ok(outcome) => debug!(program = %id, ?outcome, "execution finished"),
                Err(e) => error!(program = %id, "execution failed: {e}"),
            }
        });
    }

    /// Manual trigger: run program `id` in the background.
    pub fn start_program(&self, id: &str) -> Result<(), ExecuteError> {
        let program = self.inner.programs.get(id).map_err(|e| match e {
            ProgramError::Storage(e) => ExecuteError::Storage(e),
            _ => ExecuteError::NotFound(id.to_string()),
        })?;
        if program.steps.is_empty() {
            return Err(ExecuteError::InvalidSteps);
        }
        if let Some(owner) = self.running_program() {
            return Err(ExecuteError::AlreadyRunning(owner));
        }
        self.spawn_execution(program, true);
        Ok(())
    }

    /// Stop whatever program is running: zones first, then the run state.
    /// False when nothing was running.
    pub async fn stop_current(&self) -> bool {
        let state = self.inner.run_state.load();
        let signalled = self.signal_stop();
        if !state.program_running && !signalled {
            debug!("stop requested with no program running");
            return false;
        }

        info!(program = ?state.current_program_id, "stopping current program");
        self.inner.zones.stop_all();
        if !self.persist(&RunState::idle()).await {
            error!("could not confirm run state release");
        }
        true
    }

    /// Force everything off and the run state idle. Used at boot, at
    /// shutdown and after repeated failures.
    pub async fn reset_state(&self) {
        info!("resetting run state and switching all zones off");
        self.signal_stop();
        self.inner.zones.stop_all();
        if !self.persist(&RunState::idle()).await {
            error!("could not confirm run state reset");
        }
    }

    pub fn get_run_state(&self) -> RunStatus {
        let state = self.inner.run_state.load();
        let active_zone = if state.program_running {
            self.inner.zones.status().into_iter().find(|z| z.active)
        } else {
            None
        };
        RunStatus {
            program_running: state.program_running,
            current_program_id: state.current_program_id,
            active_zone,
        }
    }

    // -- automatic scheduling -----------------------------------------------

    /// Start the first enabled program whose activation time, month and
    /// recurrence all match `now`, preempting any running program. Returns
    /// the ids started.
    pub async fn due_check(&self, now: OffsetDateTime) -> Result<Vec<String>, StoreError> {
        if !self.inner.settings.automatic_enabled {
            debug!("automatic programs disabled, skipping due check");
            return Ok(Vec::new());
        }

        let clock = ClockTime {
            hour: now.hour(),
            minute: now.minute(),
        };
        let today = CalendarDate::from(now.date());
        let running = self.inner.run_state.load();

        let mut due = self
            .inner
            .programs
            .list()?
            .into_iter()
            .filter(|p| is_due_now(p, clock, today, &running));
        let Some(program) = due.next() else {
            return Ok(Vec::new());
        };
        for deferred in due {
            info!(program = %deferred.id, "due program deferred to the next check");
        }

        if running.program_running || self.signal_stop() {
            info!(
                preempted = ?running.current_program_id,
                program = %program.id,
                "preempting running program"
            );
            self.stop_current().await;
            self.wait_for_stopping_run().await;
            tokio::time::sleep(self.inner.settings.settle_delay).await;
        }

        info!(program = %program.id, at = %program.activation_time, "scheduled program due");
        let id = program.id.clone();
        self.spawn_execution(program, false);
        Ok(vec![id])
    }

    // -- program CRUD -------------------------------------------------------

    pub fn list_programs(&self) -> Result<Vec<Program>, StoreError> {
        self.inner.programs.list()
    }

    pub fn create_program(&self, draft: ProgramDraft) -> Result<Program, ProgramError> {
        self.inner.programs.create(draft)
    }

    /// Edit a program, stopping it first if it is the one running.
    pub async fn update_program(
        &self,
        id: &str,
        draft: ProgramDraft,
    ) -> Result<Program, ProgramError> {
        self.inner.programs.get(id)?;
        self.stop_if_running(id).await;
        self.inner.programs.update(id, draft)
    }

    /// Delete a program, stopping it first if it is the one running.
    pub async fn delete_program(&self, id: &str) -> Result<(), ProgramError> {
        self.inner.programs.get(id)?;
        self.stop_if_running(id).await;
        self.inner.programs.delete(id)
    }

    pub fn toggle_program_automation(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<Program, ProgramError> {
        self.inner.programs.set_automation(id, enabled)
    }

    async fn stop_if_running(&self, id: &str) {
        if self.inner.run_state.load().is_owned_by(id) {
            info!(program = %id, "stopping program before modifying it");
            self.stop_current().await;
        }
    }
}

fn minutes(n: u32) -> Duration {
    Duration::from_secs(u64::from(n) * 60)
}

fn is_due_now(
    program: &Program,
    clock: ClockTime,
    today: CalendarDate,
    running: &RunState,
) -> bool {
    if !program.automation_enabled || running.is_owned_by(&program.id) {
        return false;
    }
    let at = match program.activation_time.parse::<ClockTime>() {
        Ok(at) => at,
        Err(e) => {
            warn!(program = %program.id, "unusable activation time: {e}");
            return false;
        }
    };
    let Some(matched) = schedule::match_activation_time(clock, at) else {
        return false;
    };

    let in_season = schedule::is_active_this_month(program, today.month);
    let due = in_season && schedule::is_due_today(program, today);
    debug!(program = %program.id, ?matched, in_season, due, "activation time matched");
    due
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Counts consecutive due-check failures inside a rolling window.
struct FailureBudget {
    consecutive: u32,
    window_start: Instant,
}

impl FailureBudget {
    fn new(now: Instant) -> Self {
        Self {
            consecutive: 0,
            window_start: now,
        }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Record a failure. True when it is time to escalate.
    fn failure(&mut self, now: Instant) -> bool {
        self.consecutive += 1;
        if now.duration_since(self.window_start) > FAILURE_WINDOW {
            info!("failure counter reset after a quiet hour");
            self.consecutive = 1;
            self.window_start = now;
        }
        if self.consecutive >= MAX_CONSECUTIVE_FAILURES {
            self.consecutive = 0;
            return true;
        }
        false
    }
}

/// Local wall-clock time, or UTC when the offset is unknown.
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Run the due check every 30 s forever. Intended to be `tokio::spawn`-ed
/// from main.
pub async fn run(scheduler: Scheduler) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut budget = FailureBudget::new(Instant::now());

    info!(
        tick_sec = TICK_INTERVAL.as_secs(),
        automatic = scheduler.settings().automatic_enabled,
        "scheduler started"
    );

    loop {
        ticker.tick().await;

        match scheduler.due_check(local_now()).await {
            Ok(started) => {
                budget.success();
                if !started.is_empty() {
                    info!(programs = ?started, "scheduled programs started");
                }
            }
            Err(e) => {
                error!("due check failed: {e}");
                if budget.failure(Instant::now()) {
                    error!(
                        max = MAX_CONSECUTIVE_FAILURES,
                        "too many consecutive failures, forcing reset"
                    );
                    scheduler.reset_state().await;
                    tokio::time::sleep(ESCALATION_BACKOFF).await;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
