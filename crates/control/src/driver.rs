use std::{collections::BTreeMap, future::Future};

use plotter_geom::{AxisSteps, MotorSteps};
use plotter_protocol::{MotorMode, PenState};

/// The calls a plotter device understands.
///
/// Implementations own the link and the byte-level protocol. None of these
/// methods should wait for motion to physically finish: a move is
/// acknowledged once the device has accepted it.
pub trait Driver: Send + Sync + 'static {
    fn open(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn close(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn set_motor_state(
        &self,
        m1: MotorMode,
        m2: MotorMode,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn query_step_position(&self) -> impl Future<Output = anyhow::Result<MotorSteps>> + Send;

    fn set_pen_state(&self, state: PenState) -> impl Future<Output = anyhow::Result<()>> + Send;
    fn query_pen_state(&self) -> impl Future<Output = anyhow::Result<PenState>> + Send;

    fn set_servo_position(
        &self,
        position: u16,
        channel: u8,
        ramp_rate: u16,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Moves both axes at once, taking `duration_ms` to do it. The device does
    /// the CoreXY mixing.
    fn move_both_axes(
        &self,
        duration_ms: u32,
        steps: AxisSteps,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn emergency_stop(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn configure_analog_channel(
        &self,
        channel: u8,
        enabled: bool,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Raw readings (0 to 1023) of every enabled analog channel.
    fn read_analog_values(
        &self,
    ) -> impl Future<Output = anyhow::Result<BTreeMap<u8, u16>>> + Send;

    fn read_memory(&self, address: u16) -> impl Future<Output = anyhow::Result<u8>> + Send;
}
