//! Top-level firmware object and cooperative main loop.
//!
//! [`Printer`] owns every subsystem and routes the timer wheel's due
//! callbacks to them. One turn of the main loop drains the wheel, pumps
//! motion generation, and either services a pending temperature wait or
//! consumes serial input.

use core::fmt::Write as _;

use heapless::Deque;

use crate::config::{
    ENDSTOP_SAMPLE_INTERVAL_US, FAN_HOTEND_PIN, FAN_PART_PIN, BED_PID, HEATER_BED_PIN,
    HEATER_HOTEND_PIN, HEATER_MAX_POWER, HOMING_RETRACT, HOMING_SPEED, HOMING_TIMEOUT,
    HOTEND_PID, MAX_LINE_LEN, PID_PERIOD_MS, PWM_FAN_HOTEND, PWM_FAN_PART, PWM_HEATER_BED,
    PWM_HEATER_HOTEND, RX_BUFFER_SIZE, STEPPER_PINS, TEMP_BED_ADC_CH, TEMP_HOTEND_ADC_CH,
};
use crate::endstop::EndstopBank;
use crate::error::Error;
use crate::fan::Fan;
use crate::gcode::{self, GcodeState};
use crate::hal::Board;
use crate::heater::Heater;
use crate::pwm::SoftPwm;
use crate::sched::{timer_diff, timer_is_before, TimerWheel};
use crate::serial::{LineEvent, LineReader};
use crate::stepper::Stepper;
use crate::toolhead::{AxesMask, Toolhead};
use crate::trapq::Coord;

// Timer wheel slot assignment.
pub const TIMER_STEPPER_BASE: usize = 0; // 0..=3, one per axis
pub const TIMER_ENDSTOP: usize = 4;
pub const TIMER_SOFT_PWM: usize = 5;
pub const TIMER_HEATER: usize = 6;
pub const NUM_TIMERS: usize = 7;

pub const HEATER_HOTEND: usize = 0;
pub const HEATER_BED: usize = 1;
pub const FAN_PART: usize = 0;
pub const FAN_HOTEND: usize = 1;

pub struct Printer<B: Board> {
    pub board: B,
    wheel: TimerWheel<NUM_TIMERS>,
    pub steppers: [Stepper; 4],
    pub endstops: EndstopBank,
    soft_pwm: SoftPwm,
    pub heaters: [Heater; 2],
    pub fans: [Fan; 2],
    pub toolhead: Toolhead,
    pub gcode: GcodeState,
    rx: Deque<u8, RX_BUFFER_SIZE>,
    line: LineReader,
    is_shutdown: bool,
}

impl<B: Board> Printer<B> {
    pub fn new(mut board: B) -> Self {
        let mut steppers: [Stepper; 4] = core::array::from_fn(|i| Stepper::new(STEPPER_PINS[i]));
        for s in steppers.iter_mut() {
            s.configure(&mut board);
        }
        let mut soft_pwm = SoftPwm::new();
        soft_pwm.configure(&mut board, PWM_HEATER_HOTEND, HEATER_HOTEND_PIN, false);
        soft_pwm.configure(&mut board, PWM_HEATER_BED, HEATER_BED_PIN, false);
        soft_pwm.configure(&mut board, PWM_FAN_PART, FAN_PART_PIN, false);
        soft_pwm.configure(&mut board, PWM_FAN_HOTEND, FAN_HOTEND_PIN, false);
        let heaters = [
            Heater::new(TEMP_HOTEND_ADC_CH, PWM_HEATER_HOTEND, &HOTEND_PID, HEATER_MAX_POWER),
            Heater::new(TEMP_BED_ADC_CH, PWM_HEATER_BED, &BED_PID, HEATER_MAX_POWER),
        ];
        let fans = [Fan::new(PWM_FAN_PART), Fan::new(PWM_FAN_HOTEND)];

        let mut wheel = TimerWheel::new();
        let now = board.now_us();
        wheel.insert(TIMER_ENDSTOP, now.wrapping_add(ENDSTOP_SAMPLE_INTERVAL_US));
        wheel.insert(TIMER_HEATER, now.wrapping_add(PID_PERIOD_MS * 1000));
        info!("printer core ready");

        Printer {
            board,
            wheel,
            steppers,
            endstops: EndstopBank::new(),
            soft_pwm,
            heaters,
            fans,
            toolhead: Toolhead::new(),
            gcode: GcodeState::new(),
            rx: Deque::new(),
            line: LineReader::new(),
            is_shutdown: false,
        }
    }

    // ---- serial ingress / egress ----

    /// Accept received serial bytes (the RX interrupt's hand-off point).
    pub fn rx_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.rx.push_back(b).is_err() {
                warning!("serial rx overflow, byte dropped");
            }
        }
    }

    /// Parse and execute one full command line.
    pub fn process_line(&mut self, line: &str) {
        gcode::dispatch(self, line);
    }

    pub(crate) fn respond_ok(&mut self) {
        self.board.serial_write(b"ok\r\n");
    }

    pub(crate) fn respond_error(&mut self, err: Error) {
        let mut line: heapless::String<64> = heapless::String::new();
        let _ = write!(line, "error: {}\r\n", err.response_kind());
        self.board.serial_write(line.as_bytes());
        warning!("command failed: {}", err);
    }

    pub(crate) fn respond_raw(&mut self, text: &str) {
        self.board.serial_write(text.as_bytes());
    }

    // ---- main loop ----

    /// One turn of the cooperative main loop: dispatch due timers, pump
    /// step generation, then either check a pending temperature wait or
    /// consume serial input. Never blocks.
    pub fn run_once(&mut self) {
        if self.is_shutdown {
            return;
        }
        self.dispatch_timers();
        self.service_motion();
        if let Some(idx) = self.gcode.wait_heater {
            let _ = self.heaters[idx].read_temp(&mut self.board);
            if self.heaters[idx].is_at_target() {
                self.gcode.wait_heater = None;
                self.respond_ok();
            }
        } else {
            self.pump_serial();
        }
    }

    /// Run the main loop, sleeping to the next timer, until `duration_us`
    /// has elapsed.
    pub fn run_for(&mut self, duration_us: u32) {
        let deadline = self.board.now_us().wrapping_add(duration_us);
        loop {
            self.run_once();
            if self.is_shutdown {
                return;
            }
            let next = match self.wheel.next_wake() {
                Some(w) if timer_is_before(w, deadline) => w,
                _ => break,
            };
            self.board.idle_until(next);
        }
        self.board.idle_until(deadline);
        self.run_once();
    }

    pub fn next_wake(&self) -> Option<u32> {
        self.wheel.next_wake()
    }

    fn pump_serial(&mut self) {
        while self.gcode.wait_heater.is_none() && !self.is_shutdown {
            let Some(b) = self.rx.pop_front() else { break };
            match self.line.push(b) {
                LineEvent::Pending => {}
                LineEvent::Overflow => self.respond_error(Error::ParseError),
                LineEvent::Complete => {
                    let mut buf = [0u8; MAX_LINE_LEN];
                    let len = self.line.line().len();
                    buf[..len].copy_from_slice(self.line.line());
                    self.line.clear();
                    match core::str::from_utf8(&buf[..len]) {
                        Ok(text) => self.process_line(text),
                        Err(_) => self.respond_error(Error::ParseError),
                    }
                }
            }
        }
    }

    fn dispatch_timers(&mut self) {
        while let Some((handle, waketime)) = self.wheel.pop_due(self.board.now_us()) {
            match handle {
                i if i < 4 => {
                    if let Some(next) = self.steppers[i].on_timer(&mut self.board, waketime) {
                        self.wheel.insert(i, next);
                    }
                }
                TIMER_ENDSTOP => {
                    let (next, halt_mask) = self.endstops.on_timer(&self.board, waketime);
                    for axis in 0..3 {
                        if halt_mask & (1 << axis) != 0 {
                            self.steppers[axis].stop();
                        }
                    }
                    self.wheel.insert(TIMER_ENDSTOP, next);
                }
                TIMER_SOFT_PWM => {
                    let next = self.soft_pwm.on_timer(&mut self.board, waketime);
                    if self.soft_pwm.any_enabled() {
                        self.wheel.insert(TIMER_SOFT_PWM, next);
                    }
                }
                TIMER_HEATER => {
                    for heater in self.heaters.iter_mut() {
                        heater.tick(&mut self.board, &mut self.soft_pwm);
                    }
                    self.wheel
                        .insert(TIMER_HEATER, waketime.wrapping_add(PID_PERIOD_MS * 1000));
                    self.sync_pwm_timer();
                }
                _ => {}
            }
        }
    }

    /// Generate pending steps and make sure every stepper with queued
    /// work has its edge timer armed (enabling the driver on first use).
    pub(crate) fn service_motion(&mut self) {
        let flush = self.toolhead.print_time();
        self.toolhead.generate_steps(&mut self.steppers, flush);
        for i in 0..4 {
            if self.steppers[i].queue_is_empty() || self.wheel.is_pending(TIMER_STEPPER_BASE + i)
            {
                continue;
            }
            if !self.steppers[i].is_enabled() {
                self.steppers[i].set_enable(&mut self.board, true);
            }
            if let Some(wake) = self.steppers[i].start(&mut self.board) {
                self.wheel.insert(TIMER_STEPPER_BASE + i, wake);
            }
        }
    }

    fn sync_pwm_timer(&mut self) {
        if self.soft_pwm.any_enabled() && !self.wheel.is_pending(TIMER_SOFT_PWM) {
            let wake = self.board.now_us().wrapping_add(self.soft_pwm.tick_interval());
            self.wheel.insert(TIMER_SOFT_PWM, wake);
        }
    }

    // ---- thermal / fan front-ends ----

    pub fn set_heater_target(&mut self, idx: usize, target: f32) {
        self.heaters[idx].set_target(&mut self.board, &mut self.soft_pwm, target);
        self.sync_pwm_timer();
    }

    pub fn set_fan_speed(&mut self, idx: usize, speed: f32) {
        self.fans[idx].set_speed(&mut self.board, &mut self.soft_pwm, speed);
        self.sync_pwm_timer();
    }

    // ---- motion front-ends ----

    /// Commit all pending moves and run the loop until every stepper has
    /// emitted its final edge.
    pub fn wait_moves(&mut self) -> Result<(), Error> {
        let now = self.board.now_us();
        self.toolhead.align_print_time(now);
        self.toolhead.flush()?;
        loop {
            self.service_motion();
            self.dispatch_timers();
            let busy =
                self.steppers.iter().any(|s| s.is_moving()) || self.toolhead.has_moves();
            if !busy {
                break;
            }
            match self.wheel.next_wake() {
                Some(wake) => self.board.idle_until(wake),
                None => break,
            }
        }
        Ok(())
    }

    pub fn stepper_stop_all(&mut self) {
        for i in 0..4 {
            self.steppers[i].stop();
            self.wheel.cancel(TIMER_STEPPER_BASE + i);
        }
    }

    /// Homing episode: drive the requested axes into their minimum
    /// switches at twice the homing speed, halt on the first assertion,
    /// re-origin, then retract. Fails with `HomingFailed` when no switch
    /// asserts within the timeout; the steppers are left stopped and the
    /// soft limits restored either way.
    pub fn home(&mut self, axes: AxesMask) -> Result<(), Error> {
        if axes.is_empty() {
            return Err(Error::BadArgument);
        }
        self.wait_moves()?;
        info!("homing axes {}", axes.bits());
        for axis in 0..3 {
            if axes.contains_axis(axis) {
                self.endstops.get_mut(axis).start_homing();
            }
        }
        let target = self.toolhead.begin_homing(axes);
        let now = self.board.now_us();
        self.toolhead.align_print_time(now);
        if let Err(err) = self
            .toolhead
            .move_to(target, 2.0 * HOMING_SPEED)
            .and_then(|_| self.toolhead.flush())
        {
            self.end_homing_mode(axes);
            self.toolhead.abort_homing();
            return Err(err);
        }

        let deadline = self
            .board
            .now_us()
            .wrapping_add((HOMING_TIMEOUT * 1_000_000.0) as u32);
        let mut triggered = false;
        loop {
            self.dispatch_timers();
            self.service_motion();
            for axis in 0..3 {
                if axes.contains_axis(axis) && self.endstops.get(axis).is_triggered() {
                    triggered = true;
                }
            }
            if triggered || timer_diff(self.board.now_us(), deadline) >= 0 {
                break;
            }
            let wake = match self.wheel.next_wake() {
                Some(w) if timer_is_before(w, deadline) => w,
                _ => deadline,
            };
            self.board.idle_until(wake);
        }

        self.stepper_stop_all();
        self.toolhead.discard_pending();

        if !triggered {
            self.end_homing_mode(axes);
            self.toolhead.abort_homing();
            warning!("homing timed out");
            return Err(Error::HomingFailed);
        }

        // Approach done: establish the origin and back off the switch.
        self.toolhead.finish_fast();
        for axis in 0..3 {
            if axes.contains_axis(axis) {
                self.toolhead.zero_axis(axis, &mut self.steppers[axis]);
            }
        }
        let mut retract = self.toolhead.get_position().as_array();
        for axis in 0..3 {
            if axes.contains_axis(axis) {
                retract[axis] = HOMING_RETRACT;
            }
        }
        let now = self.board.now_us();
        self.toolhead.align_print_time(now);
        let res = self
            .toolhead
            .move_to(Coord::from_array(retract), HOMING_SPEED)
            .and_then(|_| self.toolhead.flush());
        if let Err(err) = res {
            self.end_homing_mode(axes);
            self.toolhead.abort_homing();
            return Err(err);
        }
        self.end_homing_mode(axes);
        self.wait_moves()?;
        self.toolhead.complete_homing();
        info!("homing complete");
        Ok(())
    }

    fn end_homing_mode(&mut self, axes: AxesMask) {
        for axis in 0..3 {
            if axes.contains_axis(axis) {
                self.endstops.get_mut(axis).end_homing();
            }
        }
    }

    // ---- fatal path ----

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Best-effort halt: kill motion and heat, report once, go inert.
    pub fn shutdown(&mut self, reason: &str) {
        if self.is_shutdown {
            return;
        }
        self.stepper_stop_all();
        for i in 0..4 {
            self.steppers[i].set_enable(&mut self.board, false);
        }
        for idx in 0..2 {
            self.heaters[idx].set_target(&mut self.board, &mut self.soft_pwm, 0.0);
        }
        for idx in 0..2 {
            self.fans[idx].set_speed(&mut self.board, &mut self.soft_pwm, 0.0);
        }
        let mut line: heapless::String<96> = heapless::String::new();
        let _ = write!(line, "PANIC: {}\r\n", reason);
        self.board.serial_write(line.as_bytes());
        self.is_shutdown = true;
    }
}
