//! Relay outputs. The `gpio` feature gates the real rppal driver; the mock
//! board is always compiled so the controller runs (and is tested) without
//! hardware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::error::HardwareError;

/// A bank of relay outputs addressed by pin number.
///
/// `bind` claims a pin and must leave it de-energized. `write` drives a
/// previously bound pin.
pub trait OutputBoard: Send + 'static {
    fn bind(&mut self, pin: u8) -> Result<(), HardwareError>;
    fn write(&mut self, pin: u8, on: bool) -> Result<(), HardwareError>;
}

// ---------------------------------------------------------------------------
// Real GPIO board (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioBoard {
    gpio: Gpio,
    pins: HashMap<u8, OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl GpioBoard {
    pub fn new(active_low: bool) -> Result<Self, HardwareError> {
        let gpio = Gpio::new().map_err(|e| HardwareError::new(0, e.to_string()))?;
        Ok(Self {
            gpio,
            pins: HashMap::new(),
            active_low,
        })
    }

    fn drive(pin: &mut OutputPin, on: bool, active_low: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

#[cfg(feature = "gpio")]
impl OutputBoard for GpioBoard {
    fn bind(&mut self, pin: u8) -> Result<(), HardwareError> {
        let mut out = self
            .gpio
            .get(pin)
            .map_err(|e| HardwareError::new(pin, e.to_string()))?
            .into_output();
        Self::drive(&mut out, false, self.active_low);
        self.pins.insert(pin, out);
        Ok(())
    }

    fn write(&mut self, pin: u8, on: bool) -> Result<(), HardwareError> {
        let out = self
            .pins
            .get_mut(&pin)
            .ok_or_else(|| HardwareError::new(pin, "pin not bound"))?;
        Self::drive(out, on, self.active_low);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock board (development and tests, no hardware)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockPins {
    levels: HashMap<u8, bool>,
    fail_next: HashMap<u8, u32>,
    unbindable: Vec<u8>,
    writes: usize,
}

/// In-memory board. Cloning yields another handle onto the same pins, so a
/// test can keep one handle while the controller owns the other.
#[derive(Clone, Default)]
pub struct MockBoard {
    pins: Arc<Mutex<MockPins>>,
}

impl MockBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockPins> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current level of a pin; unbound pins read as off.
    pub fn is_on(&self, pin: u8) -> bool {
        self.lock().levels.get(&pin).copied().unwrap_or(false)
    }

    pub fn energized_pins(&self) -> Vec<u8> {
        let mut on: Vec<u8> = self
            .lock()
            .levels
            .iter()
            .filter(|(_, on)| **on)
            .map(|(pin, _)| *pin)
            .collect();
        on.sort_unstable();
        on
    }

    /// Make the next `count` writes to `pin` fail.
    pub fn fail_next_writes(&self, pin: u8, count: u32) {
        self.lock().fail_next.insert(pin, count);
    }

    /// Make `bind` fail for `pin`.
    pub fn refuse_bind(&self, pin: u8) {
        self.lock().unbindable.push(pin);
    }

    /// Number of successful writes so far (binds excluded).
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }
}

impl OutputBoard for MockBoard {
    fn bind(&mut self, pin: u8) -> Result<(), HardwareError> {
        let mut pins = self.lock();
        if pins.unbindable.contains(&pin) {
            return Err(HardwareError::new(pin, "[mock-gpio] pin unavailable"));
        }
        pins.levels.insert(pin, false);
        tracing::debug!(pin, "[mock-gpio] bound");
        Ok(())
    }

    fn write(&mut self, pin: u8, on: bool) -> Result<(), HardwareError> {
        let mut pins = self.lock();
        if let Some(left) = pins.fail_next.get_mut(&pin) {
            if *left > 0 {
                *left -= 1;
                return Err(HardwareError::new(pin, "[mock-gpio] injected write failure"));
            }
        }
        let Some(level) = pins.levels.get_mut(&pin) else {
            return Err(HardwareError::new(pin, "[mock-gpio] pin not bound"));
        };
        *level = on;
        pins.writes += 1;
        tracing::debug!(pin, on, "[mock-gpio] write");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
