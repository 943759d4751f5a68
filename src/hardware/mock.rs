//! Mock Hardware Implementations
//!
//! Simulated controllers for tests and the demo binary. Timing uses
//! `tokio::time::Instant`, so tests running with a paused clock
//! (`#[tokio::test(start_paused = true)]`) are fully deterministic.
//!
//! # Available Mocks
//!
//! - `MockMotorController` - axes moving at constant speed, with fault injection
//! - `MockCounterController` - timer/counter channels for acquisitions
//! - `SlitController` - pseudo controller computing gap and offset from two blades
//!
//! # Performance Characteristics
//!
//! - MockMotorController: 100 units/sec by default, no settling
//! - MockCounterController: counters tick at `1000 * (axis + 1)` counts/sec

use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use crate::controller::{ControllerAdapter, PseudoController};
use crate::state::ElementState;

// =============================================================================
// MockMotorController - Simulated Motion Controller
// =============================================================================

#[derive(Debug, Clone)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
    duration: Duration,
    /// Motion ends early in ALARM (limit switch) after this long.
    limit_after: Option<Duration>,
}

impl Motion {
    fn position_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started);
        let elapsed = self.limit_after.map_or(elapsed, |l| elapsed.min(l));
        if self.duration.is_zero() || elapsed >= self.duration {
            return self.to;
        }
        let fraction = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        self.from + (self.to - self.from) * fraction
    }

    fn finished(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.started);
        elapsed >= self.duration || self.limit_after.is_some_and(|l| elapsed >= l)
    }
}

#[derive(Debug, Clone, Default)]
struct MockAxis {
    position: f64,
    motion: Option<Motion>,
    alarm: bool,
}

#[derive(Debug, Default)]
struct Faults {
    pre_op_all: bool,
    refuse_pre_op_one: HashSet<usize>,
    start: HashSet<usize>,
    read: HashSet<usize>,
    abort: HashSet<usize>,
    limit_after: Vec<(usize, Duration)>,
}

/// Mock motor controller with constant-speed axes.
///
/// Every protocol call except `read_one`/`state_one` is appended to a call
/// log that tests can inspect.
///
/// # Example
///
/// ```rust,ignore
/// let motors = Arc::new(MockMotorController::new(2));
/// registry.register_hardware("motctrl", motors.clone())?;
/// // ... run a move ...
/// assert_eq!(motors.calls_named("start_one"), vec!["start_one(0, 10)"]);
/// ```
pub struct MockMotorController {
    axes: Mutex<Vec<MockAxis>>,
    speed: f64,
    calls: Mutex<Vec<String>>,
    reads: Mutex<usize>,
    faults: Mutex<Faults>,
}

impl MockMotorController {
    /// Create controller with `axes` axes at 0.0, moving at 100 units/sec.
    pub fn new(axes: usize) -> Self {
        Self::with_speed(axes, 100.0)
    }

    /// Create controller with custom speed
    ///
    /// # Arguments
    /// * `speed` - units per second
    pub fn with_speed(axes: usize, speed: f64) -> Self {
        Self {
            axes: Mutex::new(vec![MockAxis::default(); axes]),
            speed,
            calls: Mutex::new(Vec::new()),
            reads: Mutex::new(0),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Place an axis without moving it.
    pub fn set_position(&self, axis: usize, position: f64) {
        if let Some(a) = self.axes.lock().get_mut(axis) {
            a.position = position;
            a.motion = None;
        }
    }

    /// Position as the hardware currently sees it.
    pub fn position(&self, axis: usize) -> f64 {
        let now = Instant::now();
        self.axes.lock().get(axis).map_or(f64::NAN, |a| {
            a.motion.as_ref().map_or(a.position, |m| m.position_at(now))
        })
    }

    /// Every logged call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Logged calls of one method, in order.
    pub fn calls_named(&self, method: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split('(').next() == Some(method))
            .cloned()
            .collect()
    }

    /// Forget every logged call.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of `read_one` calls so far.
    pub fn read_count(&self) -> usize {
        *self.reads.lock()
    }

    /// Make `pre_op_all` raise.
    pub fn fail_pre_op_all(&self) {
        self.faults.lock().pre_op_all = true;
    }

    /// Make `pre_op_one(axis)` answer `false`.
    pub fn refuse_pre_op_one(&self, axis: usize) {
        self.faults.lock().refuse_pre_op_one.insert(axis);
    }

    /// Make `start_one(axis, _)` raise.
    pub fn fail_start(&self, axis: usize) {
        self.faults.lock().start.insert(axis);
    }

    /// Make `read_one(axis)` raise.
    pub fn fail_read(&self, axis: usize) {
        self.faults.lock().read.insert(axis);
    }

    /// Make `abort_one(axis)` raise.
    pub fn fail_abort(&self, axis: usize) {
        self.faults.lock().abort.insert(axis);
    }

    /// The next motion of `axis` hits a limit switch after `after`.
    pub fn hit_limit_after(&self, axis: usize, after: Duration) {
        self.faults.lock().limit_after.push((axis, after));
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn settle(axis: &mut MockAxis, now: Instant) {
        if let Some(motion) = &axis.motion {
            if motion.finished(now) {
                axis.position = motion.position_at(now);
                axis.alarm = motion.limit_after.is_some_and(|l| l < motion.duration);
                axis.motion = None;
            }
        }
    }
}

#[async_trait]
impl ControllerAdapter for MockMotorController {
    async fn pre_op_all(&self) -> Result<()> {
        self.log("pre_op_all".to_string());
        if self.faults.lock().pre_op_all {
            bail!("MockMotorController: controller in local mode");
        }
        Ok(())
    }

    async fn pre_op_one(&self, axis: usize) -> Result<bool> {
        self.log(format!("pre_op_one({axis})"));
        Ok(!self.faults.lock().refuse_pre_op_one.contains(&axis))
    }

    async fn op_all(&self) -> Result<()> {
        self.log("op_all".to_string());
        Ok(())
    }

    async fn read_one(&self, axis: usize) -> Result<f64> {
        *self.reads.lock() += 1;
        if self.faults.lock().read.contains(&axis) {
            bail!("MockMotorController: encoder of axis {axis} not responding");
        }
        let now = Instant::now();
        let mut axes = self.axes.lock();
        let Some(a) = axes.get_mut(axis) else {
            bail!("MockMotorController: no axis {axis}");
        };
        Self::settle(a, now);
        Ok(a.motion.as_ref().map_or(a.position, |m| m.position_at(now)))
    }

    async fn state_one(&self, axis: usize) -> Result<(ElementState, String)> {
        let now = Instant::now();
        let mut axes = self.axes.lock();
        let Some(a) = axes.get_mut(axis) else {
            bail!("MockMotorController: no axis {axis}");
        };
        Self::settle(a, now);
        Ok(if a.motion.is_some() {
            (ElementState::Moving, "moving".to_string())
        } else if a.alarm {
            (ElementState::Alarm, "limit switch active".to_string())
        } else {
            (ElementState::Idle, "ready".to_string())
        })
    }

    async fn start_one(&self, axis: usize, target: f64) -> Result<bool> {
        self.log(format!("start_one({axis}, {target})"));
        let limit_after = {
            let mut faults = self.faults.lock();
            if faults.start.contains(&axis) {
                bail!("MockMotorController: axis {axis} power stage off");
            }
            faults
                .limit_after
                .iter()
                .position(|(a, _)| *a == axis)
                .map(|idx| faults.limit_after.remove(idx).1)
        };

        let now = Instant::now();
        let mut axes = self.axes.lock();
        let Some(a) = axes.get_mut(axis) else {
            bail!("MockMotorController: no axis {axis}");
        };
        let from = a.motion.as_ref().map_or(a.position, |m| m.position_at(now));
        let duration = Duration::from_secs_f64((target - from).abs() / self.speed);
        a.position = from;
        a.alarm = false;
        a.motion = Some(Motion {
            from,
            to: target,
            started: now,
            duration,
            limit_after,
        });
        Ok(true)
    }

    async fn abort_one(&self, axis: usize) -> Result<()> {
        self.log(format!("abort_one({axis})"));
        if self.faults.lock().abort.contains(&axis) {
            bail!("MockMotorController: axis {axis} ignored stop");
        }
        let now = Instant::now();
        if let Some(a) = self.axes.lock().get_mut(axis) {
            if let Some(motion) = a.motion.take() {
                a.position = motion.position_at(now);
            }
        }
        Ok(())
    }
}

// =============================================================================
// MockCounterController - Simulated Timer/Counter Card
// =============================================================================

#[derive(Debug, Default)]
struct Acquisition {
    channels: HashSet<usize>,
    started: Option<Instant>,
    duration: Duration,
    stopped: Option<Instant>,
}

/// Mock counter/timer card.
///
/// Channels armed with `op_one` count while the master channel's timer runs;
/// `start_one(master, seconds)` starts the timer. The timer channel reads
/// elapsed seconds, counter channels read `1000 * (axis + 1)` counts/sec.
pub struct MockCounterController {
    channels: usize,
    acquisition: Mutex<Acquisition>,
    calls: Mutex<Vec<String>>,
}

impl MockCounterController {
    /// Counter card with `channels` channels, all idle.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            acquisition: Mutex::new(Acquisition::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every logged call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn elapsed(acq: &Acquisition, now: Instant) -> Duration {
        let Some(started) = acq.started else {
            return Duration::ZERO;
        };
        let end = acq.stopped.unwrap_or(now).min(started + acq.duration);
        end.saturating_duration_since(started)
    }

    fn check(&self, axis: usize) -> Result<()> {
        if axis >= self.channels {
            bail!("MockCounterController: no channel {axis}");
        }
        Ok(())
    }
}

#[async_trait]
impl ControllerAdapter for MockCounterController {
    async fn pre_op_all(&self) -> Result<()> {
        self.log("pre_op_all".to_string());
        *self.acquisition.lock() = Acquisition::default();
        Ok(())
    }

    async fn pre_op_one(&self, axis: usize) -> Result<bool> {
        self.log(format!("pre_op_one({axis})"));
        self.check(axis)?;
        Ok(true)
    }

    async fn op_all(&self) -> Result<()> {
        self.log("op_all".to_string());
        Ok(())
    }

    async fn op_one(&self, axis: usize) -> Result<()> {
        self.log(format!("op_one({axis})"));
        self.check(axis)?;
        self.acquisition.lock().channels.insert(axis);
        Ok(())
    }

    async fn read_one(&self, axis: usize) -> Result<f64> {
        self.check(axis)?;
        let acq = self.acquisition.lock();
        if !acq.channels.contains(&axis) {
            return Ok(0.0);
        }
        let seconds = Self::elapsed(&acq, Instant::now()).as_secs_f64();
        Ok(if axis == 0 {
            seconds
        } else {
            (seconds * 1000.0 * (axis as f64 + 1.0)).floor()
        })
    }

    async fn state_one(&self, axis: usize) -> Result<(ElementState, String)> {
        self.check(axis)?;
        let acq = self.acquisition.lock();
        let running = acq.channels.contains(&axis)
            && acq.stopped.is_none()
            && acq
                .started
                .is_some_and(|s| Instant::now() < s + acq.duration);
        Ok(if running {
            (ElementState::Moving, "counting".to_string())
        } else {
            (ElementState::Idle, "ready".to_string())
        })
    }

    async fn start_one(&self, axis: usize, preset: f64) -> Result<bool> {
        self.log(format!("start_one({axis}, {preset})"));
        self.check(axis)?;
        if !(preset.is_finite() && preset > 0.0) {
            return Ok(false);
        }
        let mut acq = self.acquisition.lock();
        acq.channels.insert(axis);
        acq.started = Some(Instant::now());
        acq.duration = Duration::from_secs_f64(preset);
        acq.stopped = None;
        Ok(true)
    }

    async fn abort_one(&self, axis: usize) -> Result<()> {
        self.log(format!("abort_one({axis})"));
        let mut acq = self.acquisition.lock();
        if acq.stopped.is_none() && acq.started.is_some() {
            acq.stopped = Some(Instant::now());
        }
        Ok(())
    }
}

// =============================================================================
// SlitController - Pseudo Controller
// =============================================================================

/// Slit made of two blades moving away from the beam centre.
///
/// `gap = top + bottom`, `offset = (top - bottom) / 2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlitController;

impl PseudoController for SlitController {
    fn pseudo_roles(&self) -> Vec<String> {
        vec!["gap".to_string(), "offset".to_string()]
    }

    fn physical_roles(&self) -> Vec<String> {
        vec!["top".to_string(), "bottom".to_string()]
    }

    fn calc_all_forward(&self, physical: &[f64]) -> Result<Vec<f64>> {
        let [top, bottom] = physical else {
            bail!("SlitController: expected 2 blade positions, got {}", physical.len());
        };
        Ok(vec![top + bottom, (top - bottom) / 2.0])
    }

    fn calc_all_inverse(&self, pseudo: &[f64]) -> Result<Vec<f64>> {
        let [gap, offset] = pseudo else {
            bail!("SlitController: expected gap and offset, got {} values", pseudo.len());
        };
        Ok(vec![gap / 2.0 + offset, gap / 2.0 - offset])
    }
}
