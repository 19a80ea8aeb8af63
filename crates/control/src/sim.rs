//! An in-memory plotter.
//!
//! It behaves like a device with CoreXY mixing, a pen lift, analog inputs
//! and readable memory, and it records every call it receives. The tests use
//! it to check what the controller sent and when; the feeder uses it to
//! preview a drawing.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::bail;
use plotter_geom::{AxisSteps, Config, MotorSteps, Point};
use plotter_protocol::{Cmd, MotorMode, PenState};

use crate::Driver;

/// A straight line the pen travelled along.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub from: Point,
    pub to: Point,
    pub pen_down: bool,
}

struct SimState {
    open: bool,
    motors: (MotorMode, MotorMode),
    position: MotorSteps,
    pen: PenState,
    servo: Option<u16>,
    analog_enabled: BTreeSet<u8>,
    analog_inputs: BTreeMap<u8, u16>,
    memory: BTreeMap<u16, u8>,
    log: Vec<Cmd>,
    segments: Vec<Segment>,
    in_flight: usize,
    max_in_flight: usize,
    fail_calls: usize,
}

pub struct Simulator {
    config: Config,
    latency: Duration,
    state: Mutex<SimState>,
}

impl Simulator {
    pub fn new(config: Config) -> Self {
        Simulator {
            config,
            latency: Duration::ZERO,
            state: Mutex::new(SimState {
                open: false,
                motors: (MotorMode::Disabled, MotorMode::Disabled),
                position: MotorSteps::default(),
                pen: PenState::Up,
                servo: None,
                analog_enabled: BTreeSet::new(),
                analog_inputs: BTreeMap::new(),
                memory: BTreeMap::new(),
                log: Vec::new(),
                segments: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
                fail_calls: 0,
            }),
        }
    }

    /// Makes every call take this long to be acknowledged.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call received so far, in the order it arrived.
    pub fn log(&self) -> Vec<Cmd> {
        self.lock().log.clone()
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.lock().segments.clone()
    }

    /// The most calls that were ever being handled at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn motor_steps(&self) -> MotorSteps {
        self.lock().position
    }

    pub fn pen(&self) -> PenState {
        self.lock().pen
    }

    pub fn servo(&self) -> Option<u16> {
        self.lock().servo
    }

    pub fn motors(&self) -> (MotorMode, MotorMode) {
        self.lock().motors
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Sets the raw reading (0 to 1023) of an analog input.
    pub fn set_analog_input(&self, channel: u8, raw: u16) {
        self.lock().analog_inputs.insert(channel, raw.min(1023));
    }

    pub fn poke(&self, address: u16, value: u8) {
        self.lock().memory.insert(address, value);
    }

    /// Makes the next `count` calls fail.
    pub fn fail_next_calls(&self, count: usize) {
        self.lock().fail_calls = count;
    }

    async fn call<T>(
        &self,
        cmd: Cmd,
        f: impl FnOnce(&mut SimState) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let needs_link = cmd != Cmd::Open;
        {
            let mut state = self.lock();
            log::trace!("sim received {cmd:?}");
            state.log.push(cmd);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.lock();
        state.in_flight -= 1;
        if state.fail_calls > 0 {
            state.fail_calls -= 1;
            bail!("simulated device failure");
        }
        if needs_link && !state.open {
            bail!("link is closed");
        }
        f(&mut state)
    }

    fn move_by(&self, state: &mut SimState, steps: AxisSteps) -> anyhow::Result<()> {
        let from = state.position;
        let Some(to) = steps
            .to_motor_steps()
            .and_then(|delta| from.checked_add(&delta))
        else {
            bail!("move by {steps:?} overflows the step counters");
        };
        state.position = to;
        state.segments.push(Segment {
            from: self.config.motor_steps_to_point(&from),
            to: self.config.motor_steps_to_point(&to),
            pen_down: state.pen.is_down(),
        });
        Ok(())
    }
}

impl Driver for Simulator {
    async fn open(&self) -> anyhow::Result<()> {
        self.call(Cmd::Open, |state| {
            state.open = true;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.call(Cmd::Close, |state| {
            state.open = false;
            Ok(())
        })
        .await
    }

    async fn set_motor_state(&self, m1: MotorMode, m2: MotorMode) -> anyhow::Result<()> {
        self.call(Cmd::SetMotorState(m1, m2), |state| {
            state.motors = (m1, m2);
            Ok(())
        })
        .await
    }

    async fn query_step_position(&self) -> anyhow::Result<MotorSteps> {
        self.call(Cmd::QueryStepPosition, |state| Ok(state.position))
            .await
    }

    async fn set_pen_state(&self, pen: PenState) -> anyhow::Result<()> {
        self.call(Cmd::SetPenState(pen), |state| {
            state.pen = pen;
            Ok(())
        })
        .await
    }

    async fn query_pen_state(&self) -> anyhow::Result<PenState> {
        self.call(Cmd::QueryPenState, |state| Ok(state.pen)).await
    }

    async fn set_servo_position(
        &self,
        position: u16,
        channel: u8,
        ramp_rate: u16,
    ) -> anyhow::Result<()> {
        let cmd = Cmd::SetServoPosition {
            position,
            channel,
            ramp_rate,
        };
        self.call(cmd, |state| {
            state.servo = Some(position);
            Ok(())
        })
        .await
    }

    async fn move_both_axes(&self, duration_ms: u32, steps: AxisSteps) -> anyhow::Result<()> {
        self.call(Cmd::MoveBothAxes { duration_ms, steps }, |state| {
            if duration_ms == 0 {
                bail!("move duration must be positive");
            }
            // Like the real board, moving powers up any disabled motor.
            if !state.motors.0.is_enabled() || !state.motors.1.is_enabled() {
                log::debug!("sim enabling motors for a move");
                state.motors = (MotorMode::Sixteenth, MotorMode::Sixteenth);
            }
            self.move_by(state, steps)
        })
        .await
    }

    async fn emergency_stop(&self) -> anyhow::Result<()> {
        self.call(Cmd::EmergencyStop, |_| Ok(())).await
    }

    async fn configure_analog_channel(&self, channel: u8, enabled: bool) -> anyhow::Result<()> {
        self.call(
            Cmd::ConfigureAnalogChannel { channel, enabled },
            |state| {
                if enabled {
                    state.analog_enabled.insert(channel);
                } else {
                    state.analog_enabled.remove(&channel);
                }
                Ok(())
            },
        )
        .await
    }

    async fn read_analog_values(&self) -> anyhow::Result<BTreeMap<u8, u16>> {
        self.call(Cmd::ReadAnalogValues, |state| {
            Ok(state
                .analog_enabled
                .iter()
                .map(|ch| (*ch, state.analog_inputs.get(ch).copied().unwrap_or(0)))
                .collect())
        })
        .await
    }

    async fn read_memory(&self, address: u16) -> anyhow::Result<u8> {
        self.call(Cmd::ReadMemory(address), |state| {
            // Untouched memory reads as zero.
            Ok(state.memory.get(&address).copied().unwrap_or(0))
        })
        .await
    }
}
