use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use plotter_geom::{Config, Point};
use plotter_protocol::{MotorMode, PenState};

use crate::{
    queue::{CommandQueue, Completion},
    Driver, Error, Result,
};

/// Full-scale reading of an analog channel.
const ANALOG_FULL_SCALE: f64 = 1023.0;

/// Where the pen is headed, and how fast.
#[derive(Clone, Copy, Debug)]
struct Motion {
    /// The most recently requested destination.
    target: Point,
    /// The destination of the most recently enqueued move. The next move
    /// starts from here, even if this one hasn't physically finished.
    last_commanded: Point,
    mm_per_sec: f64,
}

/// A plotter, as seen from the host.
///
/// Anything that moves a motor or servo, or reads device state, is submitted
/// to a [`CommandQueue`] and returns a [`Completion`]. The submission itself
/// happens when the method is called, not when the completion is first
/// polled, so calls made back to back run in that order even if their
/// completions are awaited later (or never). Pure bookkeeping like
/// [`Plotter::set_speed`] takes effect immediately.
///
/// Every device operation fails with [`Error::NotConnected`] until
/// [`Plotter::connect`] succeeds.
pub struct Plotter<D> {
    driver: Arc<D>,
    config: Config,
    queue: CommandQueue,
    connected: AtomicBool,
    /// Held while opening or closing the link.
    link: tokio::sync::Mutex<()>,
    motion: Arc<Mutex<Motion>>,
}

fn lock(motion: &Mutex<Motion>) -> MutexGuard<'_, Motion> {
    motion.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D: Driver> Plotter<D> {
    /// Must be called from within a tokio runtime.
    pub fn new(driver: D, config: Config) -> Self {
        let origin = Point::new(0.0, 0.0);
        Plotter {
            driver: Arc::new(driver),
            config,
            queue: CommandQueue::new(),
            connected: AtomicBool::new(false),
            link: tokio::sync::Mutex::new(()),
            motion: Arc::new(Mutex::new(Motion {
                target: origin,
                last_commanded: origin,
                mm_per_sec: config.default_mm_per_sec,
            })),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Is there any device work waiting or running?
    pub fn is_busy(&self) -> bool {
        self.queue.is_busy()
    }

    pub async fn connect(&self) -> Result<()> {
        let _link = self.link.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.driver.open().await?;
        self.connected.store(true, Ordering::SeqCst);
        log::info!("connected");
        Ok(())
    }

    /// Closes the link right away. Anything still queued will fail when it
    /// reaches the device.
    pub async fn disconnect(&self) -> Result<()> {
        let _link = self.link.lock().await;
        if !self.is_connected() {
            return Ok(());
        }
        if self.is_busy() {
            log::warn!("disconnecting with work still queued");
        }
        self.driver.close().await?;
        self.connected.store(false, Ordering::SeqCst);
        log::info!("disconnected");
        Ok(())
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn enqueue<F, Fut, T>(&self, op: F) -> Completion<T>
    where
        F: FnOnce(Arc<D>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let driver = self.driver.clone();
        self.queue.enqueue(move || op(driver))
    }

    /// Like `enqueue`, but fails immediately if there's no link.
    fn submit<F, Fut, T>(&self, op: F) -> Completion<T>
    where
        F: FnOnce(Arc<D>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match self.check_connected() {
            Ok(()) => self.enqueue(op),
            Err(e) => Completion::ready(Err(e)),
        }
    }

    pub fn enable(&self) -> Completion<()> {
        self.set_motors(MotorMode::Sixteenth)
    }

    pub fn disable(&self) -> Completion<()> {
        self.set_motors(MotorMode::Disabled)
    }

    fn set_motors(&self, mode: MotorMode) -> Completion<()> {
        self.submit(move |driver| async move {
            driver.set_motor_state(mode, mode).await?;
            Ok(())
        })
    }

    /// Asks the device where the pen is.
    pub fn current_position(&self) -> Completion<Point> {
        let config = self.config;
        self.submit(move |driver| async move {
            let steps = driver.query_step_position().await?;
            Ok(config.motor_steps_to_point(&steps))
        })
    }

    /// Replaces the locally tracked position with the device's.
    ///
    /// After [`Plotter::stop`] the moves that were dropped from the queue
    /// never happen, so the last commanded position is stale until this is
    /// called. Only call it with no moves outstanding: moves submitted
    /// before it resolves were planned from the stale position.
    pub fn sync_position(&self) -> Completion<Point> {
        let config = self.config;
        let motion = self.motion.clone();
        self.submit(move |driver| async move {
            let steps = driver.query_step_position().await?;
            let p = config.motor_steps_to_point(&steps);
            let mut motion = lock(&motion);
            motion.target = p;
            motion.last_commanded = p;
            log::info!("resynchronized position to ({}, {})", p.x, p.y);
            Ok(p)
        })
    }

    pub fn pen_up(&self) -> Completion<()> {
        self.set_pen(PenState::Up)
    }

    pub fn pen_down(&self) -> Completion<()> {
        self.set_pen(PenState::Down)
    }

    // The device is the authority on where the pen is, so ask it before
    // deciding whether to wait for the pen to settle.
    fn set_pen(&self, state: PenState) -> Completion<()> {
        let settle = self.config.pen_settle();
        self.submit(move |driver| async move {
            let before = driver.query_pen_state().await?;
            driver.set_pen_state(state).await?;
            if before != state {
                log::debug!("pen {before:?} -> {state:?}, settling for {settle:?}");
                tokio::time::sleep(settle).await;
            }
            Ok(())
        })
    }

    /// Moves the pen servo to a normalized height: 1 is fully raised and 0 is
    /// fully lowered. Out-of-range heights are clamped.
    ///
    /// This doesn't wait for the servo to get there.
    pub fn set_pen_height(&self, height: f64) -> Completion<()> {
        let position = self.config.servo_position(height);
        let channel = self.config.servo_channel;
        let ramp_rate = self.config.servo_ramp_rate;
        self.submit(move |driver| async move {
            driver
                .set_servo_position(position, channel, ramp_rate)
                .await?;
            Ok(())
        })
    }

    /// Sets the drawing speed, clamped to the configured limits, and returns
    /// the speed that actually took effect.
    pub fn set_speed(&self, mm_per_sec: f64) -> f64 {
        let mut motion = lock(&self.motion);
        match self.config.clamp_speed(mm_per_sec) {
            Some(speed) => {
                if speed != mm_per_sec {
                    log::debug!("clamped speed {mm_per_sec} to {speed}");
                }
                motion.mm_per_sec = speed;
            }
            None => log::warn!("ignoring speed {mm_per_sec}"),
        }
        motion.mm_per_sec
    }

    pub fn speed(&self) -> f64 {
        lock(&self.motion).mm_per_sec
    }

    pub fn target_position(&self) -> Point {
        lock(&self.motion).target
    }

    pub fn last_commanded_position(&self) -> Point {
        lock(&self.motion).last_commanded
    }

    /// Moves in a straight line to `to` at the current speed.
    ///
    /// The move is planned from wherever the previous move was headed, and
    /// resolves once the device has accepted it and the travel time has
    /// elapsed. A move that would take less than the configured minimum is
    /// skipped. A destination the device can't count steps to is rejected
    /// with [`Error::InvalidArgument`], leaving the tracked positions alone.
    pub fn move_to(&self, to: Point) -> Completion<()> {
        if let Err(e) = self.check_connected() {
            return Completion::ready(Err(e));
        }

        let planned = {
            let mut motion = lock(&self.motion);
            let plan = self
                .config
                .plan_move(&motion.last_commanded, &to, motion.mm_per_sec);
            let planned = match plan {
                Ok(planned) => planned,
                Err(e) => {
                    return Completion::ready(Err(Error::InvalidArgument(format!(
                        "cannot move to ({}, {}): {e}",
                        to.x, to.y
                    ))))
                }
            };
            motion.target = to;
            if planned.is_some() {
                motion.last_commanded = to;
            }
            planned
        };

        let Some(mv) = planned else {
            log::debug!("already at ({}, {}), skipping move", to.x, to.y);
            return Completion::ready(Ok(()));
        };
        log::debug!(
            "move to ({}, {}): {:?} over {}ms",
            to.x,
            to.y,
            mv.steps,
            mv.duration_ms
        );

        self.enqueue(move |driver| async move {
            driver.move_both_axes(mv.duration_ms, mv.steps).await?;
            // The device acknowledges a move as soon as it has accepted it, so
            // wait out the travel time separately.
            tokio::time::sleep(mv.duration()).await;
            Ok(())
        })
    }

    /// Discards all queued work that hasn't started and sends an emergency
    /// stop right away, ahead of anything queued. The stop is sent whether or
    /// not the completion is awaited.
    ///
    /// An operation that is already running isn't interrupted by this, so
    /// the plotter stays busy until it finishes. The last commanded position
    /// no longer reflects the pen: see [`Plotter::sync_position`].
    pub fn stop(&self) -> Completion<()> {
        let dropped = self.queue.clear();
        log::warn!("emergency stop, discarded {dropped} queued operations");

        if let Err(e) = self.check_connected() {
            return Completion::ready(Err(e));
        }
        let driver = self.driver.clone();
        Completion::spawn(async move {
            driver.emergency_stop().await?;
            Ok(())
        })
    }

    pub fn analog_configure(&self, channel: u8, enabled: bool) -> Completion<()> {
        if !self.config.is_valid_analog_channel(channel) {
            return Completion::ready(Err(Error::InvalidArgument(format!(
                "analog channel {channel} is out of range (0 to {})",
                self.config.analog_channels.saturating_sub(1)
            ))));
        }
        self.submit(move |driver| async move {
            driver.configure_analog_channel(channel, enabled).await?;
            Ok(())
        })
    }

    /// Reads an analog channel, normalized to `[0, 1]`.
    pub fn analog_read(&self, channel: u8) -> Completion<f64> {
        self.submit(move |driver| async move {
            let values = driver.read_analog_values().await?;
            let raw = values
                .get(&channel)
                .ok_or(Error::ChannelNotEnabled(channel))?;
            Ok(f64::from(*raw) / ANALOG_FULL_SCALE)
        })
    }

    pub fn memory_read(&self, address: u16) -> Completion<u8> {
        self.submit(move |driver| async move { Ok(driver.read_memory(address).await?) })
    }

    /// Resolves once everything submitted so far has finished.
    pub fn flush(&self) -> Completion<()> {
        self.queue.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{stream::FuturesUnordered, StreamExt as _};
    use plotter_geom::{AxisSteps, ConfigBuilder, MAX_MM_PER_SEC, MIN_MM_PER_SEC};
    use plotter_protocol::Cmd;
    use tokio::time::Instant;

    use super::*;
    use crate::sim::Simulator;

    async fn connected() -> Plotter<Simulator> {
        let config = Config::default();
        let plotter = Plotter::new(Simulator::new(config), config);
        plotter.connect().await.unwrap();
        plotter
    }

    fn moves(sim: &Simulator) -> Vec<(u32, AxisSteps)> {
        sim.log()
            .into_iter()
            .filter_map(|cmd| match cmd {
                Cmd::MoveBothAxes { duration_ms, steps } => Some((duration_ms, steps)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_reach_device_in_order() {
        let config = Config::default();
        let sim = Simulator::new(config).with_latency(Duration::from_millis(3));
        for addr in 0..8 {
            sim.poke(addr, addr as u8 * 2);
        }
        let plotter = Plotter::new(sim, config);
        plotter.connect().await.unwrap();

        let mut pending = FuturesUnordered::new();
        for addr in 0..8u16 {
            let read = plotter.memory_read(addr);
            pending.push(async move { (addr, read.await) });
        }

        let mut order = Vec::new();
        while let Some((addr, value)) = pending.next().await {
            assert_eq!(value.unwrap(), addr as u8 * 2);
            order.push(addr);
        }
        assert_eq!(order, (0..8).collect::<Vec<_>>());

        let reads: Vec<_> = plotter
            .driver()
            .log()
            .into_iter()
            .filter_map(|cmd| match cmd {
                Cmd::ReadMemory(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(reads, (0..8).collect::<Vec<_>>());
        assert_eq!(plotter.driver().max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_operations_never_overlap() {
        let config = Config::default();
        let plotter = Plotter::new(
            Simulator::new(config).with_latency(Duration::from_millis(2)),
            config,
        );
        plotter.connect().await.unwrap();

        let a = plotter.pen_down();
        let b = plotter.move_to(Point::new(5.0, 5.0));
        let c = plotter.current_position();
        let d = plotter.pen_up();
        let e = plotter.move_to(Point::new(0.0, 0.0));
        let (a, b, c, d, e) = tokio::join!(a, b, c, d, e);
        a.unwrap();
        b.unwrap();
        d.unwrap();
        e.unwrap();
        assert_eq!(c.unwrap(), Point::new(5.0, 5.0));
        assert_eq!(plotter.driver().max_in_flight(), 1);
        assert!(!plotter.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn move_steps_and_timing() {
        let plotter = connected().await;
        assert_eq!(plotter.speed(), 25.0);

        let start = Instant::now();
        plotter.move_to(Point::new(30.0, 40.0)).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2000));
        assert!(elapsed < Duration::from_millis(2010));

        assert_eq!(
            moves(plotter.driver()),
            vec![(2000, AxisSteps { x: 2400, y: 3200 })]
        );
        assert_eq!(
            plotter.current_position().await.unwrap(),
            Point::new(30.0, 40.0)
        );
    }

    // The second move must be planned from the first one's destination, even
    // though the first hasn't finished when the second is submitted.
    #[tokio::test(start_paused = true)]
    async fn back_to_back_moves() {
        let plotter = connected().await;
        plotter.set_speed(100.0);

        let first = plotter.move_to(Point::new(10.0, 0.0));
        assert_eq!(plotter.last_commanded_position(), Point::new(10.0, 0.0));
        let second = plotter.move_to(Point::new(10.0, -10.0));
        assert_eq!(plotter.target_position(), Point::new(10.0, -10.0));
        assert_eq!(plotter.last_commanded_position(), Point::new(10.0, -10.0));

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(
            moves(plotter.driver()),
            vec![
                (100, AxisSteps { x: 800, y: 0 }),
                (100, AxisSteps { x: 0, y: -800 })
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn moves_past_the_step_counters_are_rejected() {
        let plotter = connected().await;
        plotter.set_speed(MAX_MM_PER_SEC);

        // 3e7mm is 2.4e9 steps, which no step counter holds.
        for to in [
            Point::new(3e7, 0.0),
            Point::new(-3e7, 0.0),
            Point::new(f64::NAN, 0.0),
        ] {
            assert!(matches!(
                plotter.move_to(to).await,
                Err(Error::InvalidArgument(_))
            ));
        }
        assert_eq!(plotter.target_position(), Point::new(0.0, 0.0));
        assert_eq!(plotter.last_commanded_position(), Point::new(0.0, 0.0));
        assert!(moves(plotter.driver()).is_empty());

        // Each end fits, but the displacement between them doesn't.
        plotter.move_to(Point::new(2e7, 0.0)).await.unwrap();
        assert!(matches!(
            plotter.move_to(Point::new(-2e7, 0.0)).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(plotter.last_commanded_position(), Point::new(2e7, 0.0));
        assert_eq!(
            moves(plotter.driver())
                .into_iter()
                .map(|(_, steps)| steps)
                .collect::<Vec<_>>(),
            vec![AxisSteps {
                x: 1_600_000_000,
                y: 0
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_length_move_is_skipped() {
        let plotter = connected().await;
        let start = Instant::now();
        plotter.move_to(Point::new(0.0, 0.0)).await.unwrap();
        // 0.01mm at 25mm/s rounds to zero milliseconds.
        plotter.move_to(Point::new(0.01, 0.0)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(moves(plotter.driver()).is_empty());
        assert_eq!(plotter.target_position(), Point::new(0.01, 0.0));
        assert_eq!(plotter.last_commanded_position(), Point::new(0.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn speed_is_clamped() {
        let plotter = connected().await;
        assert_eq!(plotter.set_speed(-5.0), MIN_MM_PER_SEC);
        assert_eq!(plotter.set_speed(1000.0), MAX_MM_PER_SEC);
        assert_eq!(plotter.set_speed(f64::NAN), MAX_MM_PER_SEC);
        assert_eq!(plotter.set_speed(f64::NEG_INFINITY), MIN_MM_PER_SEC);
        assert_eq!(plotter.set_speed(f64::NAN), MIN_MM_PER_SEC);
        assert_eq!(plotter.set_speed(f64::INFINITY), MAX_MM_PER_SEC);
        assert_eq!(plotter.set_speed(50.0), 50.0);
        assert_eq!(plotter.speed(), 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn pen_settles_only_on_transition() {
        let plotter = connected().await;

        let start = Instant::now();
        plotter.pen_down().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1000));

        let start = Instant::now();
        plotter.pen_down().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(1));

        let start = Instant::now();
        plotter.pen_up().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1000));

        let pen_cmds: Vec<_> = plotter
            .driver()
            .log()
            .into_iter()
            .filter(|cmd| matches!(cmd, Cmd::SetPenState(_)))
            .collect();
        assert_eq!(
            pen_cmds,
            vec![
                Cmd::SetPenState(PenState::Down),
                Cmd::SetPenState(PenState::Down),
                Cmd::SetPenState(PenState::Up),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pen_height_maps_to_servo() {
        let config = ConfigBuilder::default()
            .with_servo_range(10000, 20000)
            .with_servo_channel(4, 150)
            .build();
        let plotter = Plotter::new(Simulator::new(config), config);
        plotter.connect().await.unwrap();

        plotter.set_pen_height(1.0).await.unwrap();
        plotter.set_pen_height(0.5).await.unwrap();
        plotter.set_pen_height(-1.0).await.unwrap();

        let servo: Vec<_> = plotter
            .driver()
            .log()
            .into_iter()
            .filter_map(|cmd| match cmd {
                Cmd::SetServoPosition {
                    position,
                    channel,
                    ramp_rate,
                } => Some((position, channel, ramp_rate)),
                _ => None,
            })
            .collect();
        assert_eq!(
            servo,
            vec![(20000, 4, 150), (15000, 4, 150), (10000, 4, 150)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn analog_channels() {
        let plotter = connected().await;
        plotter.driver().set_analog_input(3, 512);

        assert!(matches!(
            plotter.analog_read(3).await,
            Err(Error::ChannelNotEnabled(3))
        ));

        plotter.analog_configure(3, true).await.unwrap();
        let value = plotter.analog_read(3).await.unwrap();
        assert!((value - 512.0 / 1023.0).abs() < 1e-12);

        plotter.analog_configure(3, false).await.unwrap();
        assert!(matches!(
            plotter.analog_read(3).await,
            Err(Error::ChannelNotEnabled(3))
        ));

        assert!(matches!(
            plotter.analog_configure(13, true).await,
            Err(Error::InvalidArgument(_))
        ));
        plotter.analog_configure(12, true).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_queued_moves() {
        let plotter = connected().await;

        let queued = [
            plotter.move_to(Point::new(10.0, 0.0)),
            plotter.move_to(Point::new(10.0, 10.0)),
            plotter.move_to(Point::new(0.0, 10.0)),
        ];
        plotter.stop().await.unwrap();
        assert!(!plotter.is_busy());

        for c in queued {
            assert!(matches!(c.await, Err(Error::Cancelled)));
        }
        plotter.flush().await.unwrap();

        let log = plotter.driver().log();
        assert!(log.contains(&Cmd::EmergencyStop));
        assert!(moves(plotter.driver()).is_empty());

        // The dropped moves never happened, so the tracked position is wrong
        // until it's resynchronized.
        assert_eq!(plotter.last_commanded_position(), Point::new(0.0, 10.0));
        let p = plotter.sync_position().await.unwrap();
        assert_eq!(p, Point::new(0.0, 0.0));
        assert_eq!(plotter.last_commanded_position(), Point::new(0.0, 0.0));
        assert_eq!(plotter.target_position(), Point::new(0.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_sent_without_being_awaited() {
        let plotter = connected().await;
        let _stop = plotter.stop();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(plotter.driver().log().last(), Some(&Cmd::EmergencyStop));
    }

    // The move already handed to the device keeps going, and keeps the
    // plotter busy until it's done. Only the waiting moves are dropped.
    #[tokio::test(start_paused = true)]
    async fn stop_leaves_running_move_alone() {
        let plotter = connected().await;

        // 100mm at 25mm/s takes four seconds.
        let running = plotter.move_to(Point::new(100.0, 0.0));
        let queued = plotter.move_to(Point::new(100.0, 100.0));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(moves(plotter.driver()).len(), 1);

        let stop = plotter.stop();
        assert!(plotter.is_busy());
        stop.await.unwrap();
        assert!(plotter.is_busy());
        assert!(matches!(queued.await, Err(Error::Cancelled)));

        let start = Instant::now();
        running.await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(3000));
        assert!(!plotter.is_busy());

        let log = plotter.driver().log();
        let estop = log.iter().position(|cmd| *cmd == Cmd::EmergencyStop);
        let first_move = log
            .iter()
            .position(|cmd| matches!(cmd, Cmd::MoveBothAxes { .. }));
        assert!(first_move < estop);
        assert_eq!(moves(plotter.driver()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_failure_reaches_only_its_caller() {
        let plotter = connected().await;
        plotter.driver().poke(7, 42);
        plotter.driver().fail_next_calls(1);

        let enable = plotter.enable();
        let read = plotter.memory_read(7);
        assert!(matches!(enable.await, Err(Error::Driver(_))));
        assert_eq!(read.await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn everything_needs_a_connection() {
        let config = Config::default();
        let plotter = Plotter::new(Simulator::new(config), config);

        assert!(matches!(
            plotter.move_to(Point::new(1.0, 1.0)).await,
            Err(Error::NotConnected)
        ));
        assert_eq!(plotter.target_position(), Point::new(0.0, 0.0));
        assert!(matches!(plotter.enable().await, Err(Error::NotConnected)));
        assert!(matches!(plotter.pen_down().await, Err(Error::NotConnected)));
        assert!(matches!(
            plotter.current_position().await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            plotter.analog_read(0).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            plotter.memory_read(0).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(plotter.stop().await, Err(Error::NotConnected)));
        assert!(plotter.driver().log().is_empty());

        // Local bookkeeping still works.
        assert_eq!(plotter.set_speed(30.0), 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_and_disconnect_are_idempotent() {
        let plotter = connected().await;
        plotter.connect().await.unwrap();
        plotter.enable().await.unwrap();
        plotter.disconnect().await.unwrap();
        plotter.disconnect().await.unwrap();
        assert!(!plotter.is_connected());

        assert_eq!(
            plotter.driver().log(),
            vec![
                Cmd::Open,
                Cmd::SetMotorState(MotorMode::Sixteenth, MotorMode::Sixteenth),
                Cmd::Close,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_open_once() {
        let config = Config::default();
        let plotter = Plotter::new(
            Simulator::new(config).with_latency(Duration::from_millis(5)),
            config,
        );

        let (a, b) = tokio::join!(plotter.connect(), plotter.connect());
        a.unwrap();
        b.unwrap();
        assert!(plotter.is_connected());

        let (a, b) = tokio::join!(plotter.disconnect(), plotter.disconnect());
        a.unwrap();
        b.unwrap();
        assert!(!plotter.is_connected());
        assert_eq!(plotter.driver().log(), vec![Cmd::Open, Cmd::Close]);
    }

    #[tokio::test(start_paused = true)]
    async fn enable_and_disable() {
        let plotter = connected().await;
        plotter.enable().await.unwrap();
        assert_eq!(
            plotter.driver().motors(),
            (MotorMode::Sixteenth, MotorMode::Sixteenth)
        );
        plotter.disable().await.unwrap();
        assert_eq!(
            plotter.driver().motors(),
            (MotorMode::Disabled, MotorMode::Disabled)
        );
        assert_eq!(
            plotter.driver().log().last(),
            Some(&Cmd::SetMotorState(MotorMode::Disabled, MotorMode::Disabled))
        );
    }

    // Tasks race each other to submit, but whatever order they submit in is
    // the order the device sees.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submissions_from_many_tasks_keep_their_order() {
        let config = Config::default();
        let plotter = Arc::new(Plotter::new(
            Simulator::new(config).with_latency(Duration::from_millis(1)),
            config,
        ));
        plotter.connect().await.unwrap();
        let submitted = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..16u16)
            .map(|addr| {
                let plotter = plotter.clone();
                let submitted = submitted.clone();
                tokio::spawn(async move {
                    let read = {
                        let mut submitted = submitted.lock().unwrap();
                        submitted.push(addr);
                        plotter.memory_read(addr)
                    };
                    read.await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reads: Vec<_> = plotter
            .driver()
            .log()
            .into_iter()
            .filter_map(|cmd| match cmd {
                Cmd::ReadMemory(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(reads, *submitted.lock().unwrap());
        assert_eq!(plotter.driver().max_in_flight(), 1);
    }
}
