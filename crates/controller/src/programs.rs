//! Program definitions file (`programs.json`) and CRUD validation.
//!
//! The file is a JSON object keyed by program id. It is re-read on every
//! operation so hand edits are picked up, and rewritten through a temporary
//! file on every change.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::error::{ProgramError, StoreError};
use crate::program::{CalendarDate, ClockTime, Program, ProgramDraft, Recurrence, MAX_NAME_LEN};
use crate::schedule;

pub const PROGRAMS_FILE: &str = "programs.json";

pub type ProgramMap = BTreeMap<String, Program>;

/// What a program step may reference: the configured zones and the
/// longest allowed activation.
#[derive(Debug, Clone)]
pub struct StepRules {
    pub zone_ids: BTreeSet<u8>,
    pub max_duration_min: u32,
}

pub struct ProgramStore {
    path: PathBuf,
    rules: StepRules,
    write_lock: Mutex<()>,
}

impl ProgramStore {
    pub fn open(data_dir: &Path, rules: StepRules) -> Self {
        Self {
            path: data_dir.join(PROGRAMS_FILE),
            rules,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read every program. A missing file is created empty; one that is not
    /// a JSON object is logged, treated as empty and rewritten. Entries that
    /// do not parse are logged and skipped; the rest load normally.
    pub fn load(&self) -> Result<ProgramMap, StoreError> {
        let _guard = self.lock();
        self.read()
    }

    /// Replace the whole file.
    pub fn save(&self, programs: &ProgramMap) -> Result<(), StoreError> {
        let _guard = self.lock();
        self.write(programs)
    }

    fn read(&self) -> Result<ProgramMap, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "programs file missing, creating");
                let empty = ProgramMap::new();
                self.write(&empty)?;
                return Ok(empty);
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let entries: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&text) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), "programs file corrupt ({e}), resetting");
                let empty = ProgramMap::new();
                self.write(&empty)?;
                return Ok(empty);
            }
        };

        let mut programs = ProgramMap::new();
        for (id, value) in entries {
            match serde_json::from_value::<Program>(value) {
                Ok(mut program) => {
                    // The key is authoritative.
                    program.id = id.clone();
                    programs.insert(id, program);
                }
                Err(e) => warn!(program = %id, "skipping unreadable program entry: {e}"),
            }
        }
        Ok(programs)
    }

    fn write(&self, programs: &ProgramMap) -> Result<(), StoreError> {
        let body = serde_json::to_string_pretty(programs)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))
    }

    /// Every program, ordered by numeric id.
    pub fn list(&self) -> Result<Vec<Program>, StoreError> {
        let mut programs: Vec<Program> = self.load()?.into_values().collect();
        programs.sort_by_key(|p| (numeric_id(&p.id).unwrap_or(u64::MAX), p.id.clone()));
        Ok(programs)
    }

    pub fn get(&self, id: &str) -> Result<Program, ProgramError> {
        self.load()?
            .remove(id)
            .ok_or_else(|| ProgramError::NotFound(id.to_string()))
    }

    pub fn create(&self, draft: ProgramDraft) -> Result<Program, ProgramError> {
        let _guard = self.lock();
        let mut programs = self.read()?;

        let id = next_id(&programs);
        let mut program = draft.into_program(id.clone());
        canonicalize_time(&mut program);
        self.validate(&program, &programs, None)?;

        programs.insert(id.clone(), program.clone());
        self.write(&programs)?;
        info!(program = %id, name = %program.name, "program created");
        Ok(program)
    }

    /// Replace a program's editable fields. The last run date and the
    /// automation flag carry over.
    pub fn update(&self, id: &str, draft: ProgramDraft) -> Result<Program, ProgramError> {
        let _guard = self.lock();
        let mut programs = self.read()?;

        let existing = programs
            .get(id)
            .ok_or_else(|| ProgramError::NotFound(id.to_string()))?;
        let mut program = draft.into_program(id.to_string());
        program.automation_enabled = existing.automation_enabled;
        program.last_run_date = existing.last_run_date;
        canonicalize_time(&mut program);
        self.validate(&program, &programs, Some(id))?;

        programs.insert(id.to_string(), program.clone());
        self.write(&programs)?;
        info!(program = %id, "program updated");
        Ok(program)
    }

    pub fn delete(&self, id: &str) -> Result<(), ProgramError> {
        let _guard = self.lock();
        let mut programs = self.read()?;
        if programs.remove(id).is_none() {
            return Err(ProgramError::NotFound(id.to_string()));
        }
        self.write(&programs)?;
        info!(program = %id, "program deleted");
        Ok(())
    }

    pub fn set_automation(&self, id: &str, enabled: bool) -> Result<Program, ProgramError> {
        self.modify(id, |p| p.automation_enabled = enabled)
            .inspect(|_| info!(program = %id, enabled, "program automation changed"))
    }

    /// Record a completed run.
    pub fn mark_run(&self, id: &str, date: CalendarDate) -> Result<(), ProgramError> {
        self.modify(id, |p| p.last_run_date = Some(date))?;
        info!(program = %id, date = %date, "last run date advanced");
        Ok(())
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut Program)) -> Result<Program, ProgramError> {
        let _guard = self.lock();
        let mut programs = self.read()?;
        let program = programs
            .get_mut(id)
            .ok_or_else(|| ProgramError::NotFound(id.to_string()))?;
        f(program);
        let updated = program.clone();
        self.write(&programs)?;
        Ok(updated)
    }

    fn validate(
        &self,
        program: &Program,
        programs: &ProgramMap,
        exclude_id: Option<&str>,
    ) -> Result<(), ProgramError> {
        let invalid = |msg: String| Err(ProgramError::Validation(msg));

        let name_len = program.name.chars().count();
        if name_len == 0 {
            return invalid("program name is required".into());
        }
        if name_len > MAX_NAME_LEN {
            return invalid(format!("program name longer than {MAX_NAME_LEN} characters"));
        }
        let duplicate = programs
            .values()
            .filter(|p| Some(p.id.as_str()) != exclude_id)
            .any(|p| p.name == program.name);
        if duplicate {
            return invalid(format!("a program named '{}' already exists", program.name));
        }

        if program.months.is_empty() {
            return invalid("select at least one month".into());
        }
        if let Some(m) = program.months.iter().find(|m| !(1..=12).contains(*m)) {
            return invalid(format!("month {m} out of range 1..=12"));
        }

        if program.steps.is_empty() {
            return invalid("a program needs at least one step".into());
        }
        for step in &program.steps {
            if !self.rules.zone_ids.contains(&step.zone_id) {
                return invalid(format!("step uses unknown zone {}", step.zone_id));
            }
            let max = self.rules.max_duration_min;
            if step.duration_min == 0 || step.duration_min > max {
                return invalid(format!(
                    "zone {} duration {} min outside 1..={max}",
                    step.zone_id, step.duration_min
                ));
            }
        }

        if let Err(e) = program.activation_time.parse::<ClockTime>() {
            return invalid(e);
        }

        if program.recurrence == Recurrence::Custom
            && program.interval_days.unwrap_or(0) < 1
        {
            return invalid("custom recurrence needs interval_days of at least 1".into());
        }

        if let Some(msg) = schedule::check_conflicts(program, programs.values(), exclude_id) {
            return Err(ProgramError::Conflict(msg));
        }
        Ok(())
    }
}

/// Store activation times zero-padded so equal times compare equal.
/// Unparseable input is left for `validate` to reject.
fn canonicalize_time(program: &mut Program) {
    if let Ok(at) = program.activation_time.parse::<ClockTime>() {
        program.activation_time = at.to_string();
    }
}

fn numeric_id(id: &str) -> Option<u64> {
    id.parse().ok()
}

fn next_id(programs: &ProgramMap) -> String {
    let max = programs.keys().filter_map(|id| numeric_id(id)).max().unwrap_or(0);
    (max + 1).to_string()
}

// ===========================================================================
// Tests
// ===========================================================================
