//! Basic geometry of a CoreXY plotter: conversion between millimeter
//! positions and step counts, and the timing model for straight-line moves.
//!
//! Positions are measured in millimeters in the plotter's frame. The device's
//! mixed-axis move command takes step counts along the cartesian axes and
//! does the CoreXY mixing itself, so the forward map here is just a scale.
//! The motors report their own positions, though, and those need the CoreXY
//! inverse (sum and difference) to get back to a point.
//!
//! This crate supports `no_std` and uses `libm`, so the same conversions can
//! run on the device side.

#![cfg_attr(not(feature = "std"), no_std)]

use core::time::Duration;

use libm::{hypot, round};
use serde::{Deserialize, Serialize};

pub type Point = euclid::Point2D<f64, Mm>;

pub struct Mm;

pub const STEPS_PER_MM: f64 = 80.0;
pub const MAX_MM_PER_SEC: f64 = 380.0;
/// The slowest step rate the motor controller supports is 1.31 steps per second.
pub const MIN_MM_PER_SEC: f64 = 1.31 / STEPS_PER_MM;
pub const DEFAULT_MM_PER_SEC: f64 = 25.0;
pub const PEN_SETTLE_MS: u64 = 1000;

/// A displacement measured in steps along the cartesian axes.
///
/// This is what the mixed-axis move command consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSteps {
    pub x: i32,
    pub y: i32,
}

impl AxisSteps {
    /// How the two motors turn in order to produce this displacement, or
    /// `None` if either motor's count doesn't fit.
    pub fn to_motor_steps(&self) -> Option<MotorSteps> {
        Some(MotorSteps {
            m1: self.x.checked_add(self.y)?,
            m2: self.x.checked_sub(self.y)?,
        })
    }

    pub fn checked_sub(&self, rhs: &AxisSteps) -> Option<AxisSteps> {
        Some(AxisSteps {
            x: self.x.checked_sub(rhs.x)?,
            y: self.y.checked_sub(rhs.y)?,
        })
    }
}

/// The position of the two motors, measured in steps, as reported by the
/// device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorSteps {
    pub m1: i32,
    pub m2: i32,
}

impl MotorSteps {
    pub fn checked_add(&self, rhs: &MotorSteps) -> Option<MotorSteps> {
        Some(MotorSteps {
            m1: self.m1.checked_add(rhs.m1)?,
            m2: self.m2.checked_add(rhs.m2)?,
        })
    }
}

/// A position or displacement that doesn't fit in the device's step
/// counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfRange;

impl core::fmt::Display for OutOfRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("outside the range of the step counters")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for OutOfRange {}

/// A single constant-velocity segment, ready to be handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub steps: AxisSteps,
    pub duration_ms: u32,
}

impl Move {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms.into())
    }
}

pub struct ConfigBuilder {
    steps_per_mm: f64,
    min_mm_per_sec: f64,
    max_mm_per_sec: f64,
    default_mm_per_sec: f64,
    pen_settle_ms: u64,
    min_move_ms: u32,
    servo_lowered: u16,
    servo_raised: u16,
    servo_channel: u8,
    servo_ramp_rate: u16,
    analog_channels: u8,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            steps_per_mm: STEPS_PER_MM,
            min_mm_per_sec: MIN_MM_PER_SEC,
            max_mm_per_sec: MAX_MM_PER_SEC,
            default_mm_per_sec: DEFAULT_MM_PER_SEC,
            pen_settle_ms: PEN_SETTLE_MS,
            min_move_ms: 1,
            servo_lowered: 7500,
            servo_raised: 28000,
            servo_channel: 4,
            servo_ramp_rate: 0,
            analog_channels: 13,
        }
    }
}

impl ConfigBuilder {
    pub fn build(&self) -> Config {
        Config {
            steps_per_mm: self.steps_per_mm,
            min_mm_per_sec: self.min_mm_per_sec,
            max_mm_per_sec: self.max_mm_per_sec,
            default_mm_per_sec: self
                .default_mm_per_sec
                .max(self.min_mm_per_sec)
                .min(self.max_mm_per_sec),
            pen_settle_ms: self.pen_settle_ms,
            min_move_ms: self.min_move_ms,
            servo_lowered: self.servo_lowered,
            servo_raised: self.servo_raised,
            servo_channel: self.servo_channel,
            servo_ramp_rate: self.servo_ramp_rate,
            analog_channels: self.analog_channels,
        }
    }

    pub fn with_steps_per_mm(&mut self, steps: f64) -> &mut Self {
        self.steps_per_mm = steps;
        self
    }

    pub fn with_speed_limits(&mut self, min_mm_per_sec: f64, max_mm_per_sec: f64) -> &mut Self {
        self.min_mm_per_sec = min_mm_per_sec;
        self.max_mm_per_sec = max_mm_per_sec;
        self
    }

    pub fn with_default_speed(&mut self, mm_per_sec: f64) -> &mut Self {
        self.default_mm_per_sec = mm_per_sec;
        self
    }

    pub fn with_pen_settle_ms(&mut self, ms: u64) -> &mut Self {
        self.pen_settle_ms = ms;
        self
    }

    pub fn with_min_move_ms(&mut self, ms: u32) -> &mut Self {
        self.min_move_ms = ms;
        self
    }

    pub fn with_servo_range(&mut self, lowered: u16, raised: u16) -> &mut Self {
        self.servo_lowered = lowered;
        self.servo_raised = raised;
        self
    }

    pub fn with_servo_channel(&mut self, channel: u8, ramp_rate: u16) -> &mut Self {
        self.servo_channel = channel;
        self.servo_ramp_rate = ramp_rate;
        self
    }

    pub fn with_analog_channels(&mut self, count: u8) -> &mut Self {
        self.analog_channels = count;
        self
    }
}

/// The machine constants of a plotter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Steps along either cartesian axis per millimeter of travel. With the
    /// motors in 16x microstepping mode this is 80.
    pub steps_per_mm: f64,
    /// Speed requests are clamped to `[min_mm_per_sec, max_mm_per_sec]`.
    pub min_mm_per_sec: f64,
    pub max_mm_per_sec: f64,
    /// The speed a freshly constructed controller moves at.
    pub default_mm_per_sec: f64,
    /// How long the pen takes to physically finish lifting or lowering. The
    /// device doesn't report this, so we just wait.
    pub pen_settle_ms: u64,
    /// Moves that would take less than this (after rounding to whole
    /// milliseconds) are treated as already finished.
    pub min_move_ms: u32,
    /// Servo output when the pen height is 0.
    pub servo_lowered: u16,
    /// Servo output when the pen height is 1.
    pub servo_raised: u16,
    /// Which servo output drives the pen lift.
    pub servo_channel: u8,
    pub servo_ramp_rate: u16,
    /// Analog channels are numbered `0..analog_channels`.
    pub analog_channels: u8,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::default().build()
    }
}

impl Config {
    /// Clamps a requested speed into the supported range.
    ///
    /// Returns `None` for NaN, which has no sensible clamped value.
    pub fn clamp_speed(&self, mm_per_sec: f64) -> Option<f64> {
        if mm_per_sec.is_nan() {
            None
        } else {
            // Not `f64::clamp`, which panics if the limits are misconfigured.
            Some(mm_per_sec.max(self.min_mm_per_sec).min(self.max_mm_per_sec))
        }
    }

    pub fn pen_settle(&self) -> Duration {
        Duration::from_millis(self.pen_settle_ms)
    }

    fn mm_to_steps(&self, mm: f64) -> Option<i32> {
        let steps = round(mm * self.steps_per_mm);
        // NaN fails both comparisons.
        if steps >= f64::from(i32::MIN) && steps <= f64::from(i32::MAX) {
            Some(steps as i32)
        } else {
            None
        }
    }

    /// The absolute step position of a point, rounded to the nearest step.
    ///
    /// Returns `None` if the point isn't finite or is too far away to count
    /// in steps.
    pub fn point_to_axis_steps(&self, p: &Point) -> Option<AxisSteps> {
        Some(AxisSteps {
            x: self.mm_to_steps(p.x)?,
            y: self.mm_to_steps(p.y)?,
        })
    }

    pub fn point_to_motor_steps(&self, p: &Point) -> Option<MotorSteps> {
        self.point_to_axis_steps(p)?.to_motor_steps()
    }

    /// The CoreXY inverse: recovers a point from the two motor positions.
    pub fn motor_steps_to_point(&self, steps: &MotorSteps) -> Point {
        let m1 = f64::from(steps.m1);
        let m2 = f64::from(steps.m2);
        Point::new(
            0.5 * (m1 + m2) / self.steps_per_mm,
            0.5 * (m1 - m2) / self.steps_per_mm,
        )
    }

    /// Plans a straight move from `from` to `to` at `mm_per_sec`.
    ///
    /// The step counts are differences of rounded absolute positions, so that
    /// rounding errors don't accumulate over a long run of short moves.
    /// Returns `Ok(None)` if the move is too short to bother with, and
    /// [`OutOfRange`] if either end, the step counts, or the duration don't
    /// fit in what the device can count.
    pub fn plan_move(
        &self,
        from: &Point,
        to: &Point,
        mm_per_sec: f64,
    ) -> Result<Option<Move>, OutOfRange> {
        let start = self.point_to_axis_steps(from).ok_or(OutOfRange)?;
        let end = self.point_to_axis_steps(to).ok_or(OutOfRange)?;
        // The device keeps motor positions, and mixes the move into motor
        // steps itself.
        end.to_motor_steps().ok_or(OutOfRange)?;
        let steps = end.checked_sub(&start).ok_or(OutOfRange)?;
        steps.to_motor_steps().ok_or(OutOfRange)?;

        let delta = *to - *from;
        let distance = hypot(delta.x, delta.y);
        let ms = round(distance / mm_per_sec * 1000.0);
        if ms.is_nan() || ms < f64::from(self.min_move_ms) {
            return Ok(None);
        }
        if ms > f64::from(u32::MAX) {
            return Err(OutOfRange);
        }

        Ok(Some(Move {
            steps,
            duration_ms: ms as u32,
        }))
    }

    /// Maps a normalized pen height (0 is fully lowered, 1 is fully raised)
    /// to a servo output.
    pub fn servo_position(&self, height: f64) -> u16 {
        let h = if height.is_nan() {
            0.0
        } else {
            height.clamp(0.0, 1.0)
        };
        let lowered = f64::from(self.servo_lowered);
        let raised = f64::from(self.servo_raised);
        round(lowered + h * (raised - lowered)) as u16
    }

    pub fn is_valid_analog_channel(&self, channel: u8) -> bool {
        channel < self.analog_channels
    }
}
