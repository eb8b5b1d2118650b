//! Syringe geometry and unit conversion.
//!
//! The pump only knows plunger steps. How many steps make a millilitre depends
//! on the microstep mode (steps per stroke) and the syringe fitted (volume per
//! stroke). This module holds that pairing and the conversions built on it.

use crate::error::InvalidInput;
use crate::types::MicrostepMode;

/// Syringe volumes below this (in ml) initialize with half plunger force.
pub const SMALL_SYRINGE_VOLUME_ML: f64 = 1.0;

/// Immutable syringe configuration of one pump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpConfig {
    micro_step_mode: MicrostepMode,
    total_volume: f64,
    steps_per_ml: u32,
}

impl PumpConfig {
    /// Create a config for a syringe of `total_volume` ml.
    ///
    /// Fails when the syringe is so large that a millilitre is less than one step.
    pub fn new(micro_step_mode: MicrostepMode, total_volume: f64) -> Result<Self, InvalidInput> {
        if !(total_volume > 0.0 && total_volume.is_finite()) {
            return Err(InvalidInput::SyringeVolume(total_volume));
        }
        let steps_per_ml = (f64::from(micro_step_mode.total_steps()) / total_volume).floor();
        if steps_per_ml < 1.0 {
            return Err(InvalidInput::SyringeVolume(total_volume));
        }
        Ok(Self {
            micro_step_mode,
            total_volume,
            steps_per_ml: steps_per_ml as u32,
        })
    }

    pub const fn micro_step_mode(&self) -> MicrostepMode {
        self.micro_step_mode
    }

    /// Syringe volume in ml.
    pub const fn total_volume(&self) -> f64 {
        self.total_volume
    }

    pub const fn steps_per_ml(&self) -> u32 {
        self.steps_per_ml
    }

    pub const fn total_steps(&self) -> u32 {
        self.micro_step_mode.total_steps()
    }

    pub const fn max_top_velocity(&self) -> u32 {
        self.micro_step_mode.max_top_velocity()
    }

    /// Nearest step count for a volume in ml. Negative volumes clamp to 0.
    #[inline]
    pub fn volume_to_step(&self, volume_ml: f64) -> u32 {
        (volume_ml * f64::from(self.steps_per_ml)).round().max(0.0) as u32
    }

    /// Volume in ml for a step count. Not rounded.
    #[inline]
    pub fn step_to_volume(&self, step: u32) -> f64 {
        f64::from(step) / f64::from(self.steps_per_ml)
    }

    /// Convert a flow rate in ml/min to a top velocity.
    pub fn flowrate_to_speed(&self, flowrate: f64) -> Result<f64, InvalidInput> {
        if flowrate == 0.0 {
            return Err(InvalidInput::ZeroFlowrate);
        }
        Ok(self.total_volume * f64::from(self.max_top_velocity()) / flowrate)
    }

    /// Convert a top velocity back to a flow rate in ml/min.
    pub fn speed_to_flowrate(&self, speed: f64) -> f64 {
        self.total_volume / f64::from(self.max_top_velocity()) * speed
    }

    /// Whether the firmware accepts `velocity` as a top velocity in this mode.
    pub fn validate_top_velocity(&self, velocity: u32) -> bool {
        (1..=self.max_top_velocity()).contains(&velocity)
    }

    /// Operand for the plunger initialization command.
    pub fn initialization_force(&self) -> u32 {
        if self.total_volume < SMALL_SYRINGE_VOLUME_ML {
            1
        } else {
            0
        }
    }

    /// Whether `0 <= volume_ml <= total_volume`.
    pub fn is_volume_valid(&self, volume_ml: f64) -> bool {
        (0.0..=self.total_volume).contains(&volume_ml)
    }
}
