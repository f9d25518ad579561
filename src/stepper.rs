//! Per-axis step/dir/enable driver.
//!
//! The driver consumes runs of equally spaced steps (`StepperMove`) from
//! a bounded queue and turns them into individually timed edges via its
//! scheduler timer. Runs come either from the iterative solver (which
//! compresses solved step times into runs) or directly from
//! [`Stepper::queue_move`] for constant-velocity motion.

use heapless::Deque;

use crate::config::{StepperPins, MIN_STEP_INTERVAL_US, STEP_PULSE_US, STEP_QUEUE_DEPTH};
use crate::error::Error;
use crate::hal::Board;
use crate::sched::timer_is_before;

/// One run of `count` steps spaced `interval` µs apart in direction `dir`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StepperMove {
    pub interval: u32,
    pub count: u16,
    pub dir: i8,
}

pub struct Stepper {
    pins: StepperPins,
    enabled: bool,
    /// Current direction sign, +1 or -1; tracks the dir pin level.
    dir: i8,
    /// Interval of the run currently being emitted.
    interval: u32,
    /// Steps remaining in the current run; 0 means idle or stopped.
    count: u16,
    /// Scheduled time of the next edge.
    next_step_time: u32,
    /// Absolute time of the last step handed to `queue_step`; the anchor
    /// from which run intervals accumulate.
    last_queued_time: u32,
    /// Set after `stop` and at boot: the step clock must be re-anchored
    /// before new steps may be queued.
    need_reset: bool,
    /// Position in signed steps.
    position: i32,
    queue: Deque<StepperMove, STEP_QUEUE_DEPTH>,
}

impl Stepper {
    pub fn new(pins: StepperPins) -> Self {
        Stepper {
            pins,
            enabled: false,
            dir: 1,
            interval: 0,
            count: 0,
            next_step_time: 0,
            last_queued_time: 0,
            need_reset: true,
            position: 0,
            queue: Deque::new(),
        }
    }

    /// Drive all three pins to their idle levels.
    pub fn configure<B: Board>(&mut self, board: &mut B) {
        board.gpio_out_write(self.pins.step, self.pins.invert_step);
        board.gpio_out_write(self.pins.dir, self.pins.invert_dir);
        board.gpio_out_write(self.pins.enable, self.pins.invert_enable);
    }

    pub fn set_enable<B: Board>(&mut self, board: &mut B, on: bool) {
        self.enabled = on;
        board.gpio_out_write(self.pins.enable, on != self.pins.invert_enable);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_dir<B: Board>(&mut self, board: &mut B, dir: i8) {
        self.dir = if dir < 0 { -1 } else { 1 };
        board.gpio_out_write(self.pins.dir, (dir < 0) != self.pins.invert_dir);
    }

    pub fn dir(&self) -> i8 {
        self.dir
    }

    /// Re-anchor the step clock. Only legal while idle.
    pub fn reset_clock(&mut self, time_us: u32) {
        debug_assert!(!self.is_moving(), "step clock reset while stepper active");
        self.next_step_time = time_us;
        self.last_queued_time = time_us;
        self.need_reset = false;
    }

    pub fn needs_clock_reset(&self) -> bool {
        self.need_reset
    }

    /// Queue one step edge at the absolute time `time_us`. Consecutive
    /// equally spaced steps in the same direction collapse into a single
    /// run. Fails with `QueueFull` when the run queue is saturated; the
    /// caller retries after the queue drains.
    pub fn queue_step(&mut self, time_us: u32, dir: i8) -> Result<(), Error> {
        debug_assert!(!self.need_reset, "step queued before clock reset");
        let mut interval = time_us.wrapping_sub(self.last_queued_time);
        if interval == 0 {
            interval = 1;
        }
        if let Some(back) = self.queue.back_mut() {
            if back.dir == dir && back.interval == interval && back.count < u16::MAX {
                back.count += 1;
                self.last_queued_time = time_us;
                return Ok(());
            }
        }
        self.queue
            .push_back(StepperMove { interval, count: 1, dir })
            .map_err(|_| Error::QueueFull)?;
        self.last_queued_time = time_us;
        Ok(())
    }

    /// Queue a run of `count` steps spaced `interval` µs apart. Edges
    /// begin one interval after the current anchor point.
    pub fn queue_move(&mut self, interval: u32, count: u16, dir: i8) -> Result<(), Error> {
        if count == 0 {
            return Err(Error::BadArgument);
        }
        self.queue
            .push_back(StepperMove { interval, count, dir })
            .map_err(|_| Error::QueueFull)?;
        self.last_queued_time = self
            .last_queued_time
            .wrapping_add(interval.wrapping_mul(count as u32));
        Ok(())
    }

    /// If idle with queued runs, load the first one and return the wake
    /// time for the edge timer.
    pub fn start<B: Board>(&mut self, board: &mut B) -> Option<u32> {
        if self.count > 0 {
            return None;
        }
        self.load_next(board)
    }

    fn load_next<B: Board>(&mut self, board: &mut B) -> Option<u32> {
        let run = self.queue.pop_front()?;
        if run.dir != self.dir {
            self.set_dir(board, run.dir);
        }
        self.interval = run.interval;
        self.count = run.count;
        self.next_step_time = self.next_step_time.wrapping_add(run.interval);
        Some(self.next_step_time)
    }

    /// Edge timer callback: emit one step pulse and report the next wake
    /// time, or `None` once all queued runs are exhausted. Successive
    /// edges are never scheduled closer than the configured hardware
    /// minimum; a late callback slips rather than compresses.
    pub fn on_timer<B: Board>(&mut self, board: &mut B, waketime: u32) -> Option<u32> {
        if self.count == 0 {
            // Stopped between scheduling and dispatch.
            return None;
        }
        if !self.enabled {
            self.stop();
            return None;
        }
        let active = !self.pins.invert_step;
        board.gpio_out_write(self.pins.step, active);
        board.delay_us(STEP_PULSE_US);
        board.gpio_out_write(self.pins.step, !active);

        self.position += self.dir as i32;
        self.count -= 1;

        let next = if self.count > 0 {
            self.next_step_time = self.next_step_time.wrapping_add(self.interval);
            Some(self.next_step_time)
        } else {
            self.load_next(board)
        };
        next.map(|t| {
            let min_next = waketime.wrapping_add(MIN_STEP_INTERVAL_US);
            if timer_is_before(t, min_next) {
                self.next_step_time = min_next;
                min_next
            } else {
                t
            }
        })
    }

    /// Immediate stop: zero the remaining count and drop queued runs. The
    /// next dispatch of the edge timer returns do-not-reschedule.
    pub fn stop(&mut self) {
        self.count = 0;
        self.queue.clear();
        self.need_reset = true;
    }

    pub fn is_moving(&self) -> bool {
        self.count > 0 || !self.queue.is_empty()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn set_position(&mut self, position: i32) {
        self.position = position;
    }
}
