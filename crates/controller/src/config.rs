//! TOML settings file: zone bindings, the safety relay, execution limits and
//! storage location.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub safety_relay: Option<RelayEntry>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub max_active_zones: usize,
    pub max_zone_duration_min: u32,
    /// Pause between consecutive program steps.
    pub activation_delay_sec: u64,
    pub automatic_programs_enabled: bool,
    pub relay_active_low: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_active_zones: 3,
            max_zone_duration_min: 180,
            activation_delay_sec: 5,
            automatic_programs_enabled: true,
            relay_active_low: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayEntry {
    pub pin: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub id: u8,
    pub pin: i64,
    pub name: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_limits(&mut errors);
        self.validate_outputs(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_limits(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if c.max_active_zones == 0 {
            errors.push("controller: max_active_zones must be at least 1".to_string());
        }
        if c.max_zone_duration_min == 0 {
            errors.push("controller: max_zone_duration_min must be at least 1".to_string());
        }
    }

    fn validate_outputs(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<u8> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        if let Some(relay) = &self.safety_relay {
            if !VALID_GPIO_PINS.contains(&relay.pin) {
                errors.push(format!(
                    "safety_relay: pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    relay.pin
                ));
            } else {
                seen_pins.insert(relay.pin);
            }
        }

        for z in &self.zones {
            let ctx = format!("zone {}", z.id);

            if !seen_ids.insert(z.id) {
                errors.push(format!("{ctx}: duplicate id"));
            }
            if z.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            if !VALID_GPIO_PINS.contains(&z.pin) {
                errors.push(format!(
                    "{ctx}: pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    z.pin
                ));
            } else if !seen_pins.insert(z.pin) {
                errors.push(format!(
                    "{ctx}: pin {} is already used by another output",
                    z.pin
                ));
            }
        }
    }

    /// Zone bindings in the shape the zone controller expects. Only valid
    /// after `validate`, which guarantees every pin fits in a `u8`.
    pub fn zone_bindings(&self) -> Vec<crate::zones::ZoneConfig> {
        self.zones
            .iter()
            .map(|z| crate::zones::ZoneConfig {
                id: z.id,
                pin: z.pin as u8,
                name: z.name.clone(),
                visible: z.visible,
            })
            .collect()
    }

    pub fn relay_pin(&self) -> Option<u8> {
        self.safety_relay.as_ref().map(|r| r.pin as u8)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
