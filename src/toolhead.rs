//! Motion planner: move admission, lookahead velocity planning, segment
//! commit into the trapezoidal queue, and the homing episode state.
//!
//! The planner owns the trapq and the per-axis solver state; the printer
//! main loop hands it the stepper bank when steps are generated.

use bitflags::bitflags;

use crate::config::{
    AXIS_MAX, AXIS_MIN, HISTORY_RETENTION, HOMING_MARGIN, LOOKAHEAD_DEPTH, MAX_ACCEL,
    MAX_ACCEL_TO_DECEL, MAX_VELOCITY, MIN_MOVE_DISTANCE, SCHEDULE_AHEAD,
    SQUARE_CORNER_VELOCITY, STEPS_PER_MM,
};
use crate::error::Error;
use crate::itersolve::{self, print_time_to_clock, StepperKinematics};
use crate::kinematics::cartesian::{calc_direction, Axis};
use crate::sched::timer_diff;
use crate::stepper::Stepper;
use crate::trapq::{Coord, TrapQ};

bitflags! {
    /// Axes addressed by a homing request.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct AxesMask: u8 {
        const X = 1 << 0;
        const Y = 1 << 1;
        const Z = 1 << 2;
    }
}

impl AxesMask {
    pub fn contains_axis(&self, axis: usize) -> bool {
        self.bits() & (1 << axis) != 0
    }
}

/// Planner tuning and soft limits. Homing temporarily relaxes the minima.
pub struct MotionConfig {
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_accel_to_decel: f64,
    pub square_corner_velocity: f64,
    pub min_pos: [f64; 4],
    pub max_pos: [f64; 4],
}

impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            max_velocity: MAX_VELOCITY,
            max_accel: MAX_ACCEL,
            max_accel_to_decel: MAX_ACCEL_TO_DECEL,
            square_corner_velocity: SQUARE_CORNER_VELOCITY,
            min_pos: AXIS_MIN,
            max_pos: AXIS_MAX,
        }
    }
}

/// A move waiting in the lookahead ring for velocity resolution.
#[derive(Debug, Copy, Clone, Default)]
struct PlannerMove {
    start_pos: Coord,
    end_pos: Coord,
    distance: f64,
    axes_r: Coord,
    max_cruise_v: f64,
    max_start_v: f64,
    max_end_v: f64,
    start_v: f64,
    cruise_v: f64,
    end_v: f64,
}

struct LookaheadQueue {
    moves: [PlannerMove; LOOKAHEAD_DEPTH],
    head: usize,
    count: usize,
}

impl LookaheadQueue {
    fn new() -> Self {
        LookaheadQueue {
            moves: [PlannerMove::default(); LOOKAHEAD_DEPTH],
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, m: PlannerMove) -> Result<(), Error> {
        if self.count == LOOKAHEAD_DEPTH {
            return Err(Error::QueueFull);
        }
        let idx = (self.head + self.count) % LOOKAHEAD_DEPTH;
        self.moves[idx] = m;
        self.count += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<PlannerMove> {
        if self.count == 0 {
            return None;
        }
        let m = self.moves[self.head];
        self.head = (self.head + 1) % LOOKAHEAD_DEPTH;
        self.count -= 1;
        Some(m)
    }

    fn get(&self, i: usize) -> &PlannerMove {
        &self.moves[(self.head + i) % LOOKAHEAD_DEPTH]
    }

    fn get_mut(&mut self, i: usize) -> &mut PlannerMove {
        &mut self.moves[(self.head + i) % LOOKAHEAD_DEPTH]
    }

    fn len(&self) -> usize {
        self.count
    }
}

/// Homing episode progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HomingState {
    Idle,
    Fast,
    Retract,
    Done,
    Error,
}

pub struct Toolhead {
    /// Last requested end point.
    commanded_pos: Coord,
    /// Last end point handed to the trapq.
    current_pos: Coord,
    /// Planner time cursor, seconds.
    print_time: f64,
    lookahead: LookaheadQueue,
    pub config: MotionConfig,
    kin: [StepperKinematics; 4],
    trapq: TrapQ,
    /// Exit velocity of the most recently committed segment; the next
    /// commit enters at exactly this speed.
    last_commit_end_v: f64,
    homing_state: HomingState,
    saved_min_pos: Option<[f64; 4]>,
}

impl Toolhead {
    pub fn new() -> Self {
        Toolhead {
            commanded_pos: Coord::default(),
            current_pos: Coord::default(),
            print_time: 0.0,
            lookahead: LookaheadQueue::new(),
            config: MotionConfig::default(),
            kin: core::array::from_fn(|i| {
                StepperKinematics::new(Axis::from_index(i), STEPS_PER_MM[i])
            }),
            trapq: TrapQ::new(),
            last_commit_end_v: 0.0,
            homing_state: HomingState::Idle,
            saved_min_pos: None,
        }
    }

    // ---- position ----

    /// Commanded position: where the last admitted move ends.
    pub fn get_position(&self) -> Coord {
        self.commanded_pos
    }

    /// Realised position: end of the last committed segment.
    pub fn current_position(&self) -> Coord {
        self.current_pos
    }

    /// Overwrite the machine position without motion.
    pub fn set_position(&mut self, steppers: &mut [Stepper; 4], pos: Coord) {
        self.commanded_pos = pos;
        self.current_pos = pos;
        for i in 0..4 {
            self.kin[i].set_position_mm(pos.axis(i));
            steppers[i].set_position(libm::round(pos.axis(i) * STEPS_PER_MM[i]) as i32);
        }
    }

    pub fn print_time(&self) -> f64 {
        self.print_time
    }

    pub fn trapq(&self) -> &TrapQ {
        &self.trapq
    }

    pub fn homing_state(&self) -> HomingState {
        self.homing_state
    }

    /// Earliest per-axis step generation cursor; segments before this are
    /// fully consumed.
    pub fn min_flush_time(&self) -> f64 {
        self.kin
            .iter()
            .map(|sk| sk.last_flush_time())
            .fold(f64::INFINITY, f64::min)
    }

    /// Pull the print-time cursor up to the scheduler clock plus a small
    /// buffer so motion resuming from idle is never scheduled in the
    /// past. No-op while the cursor is already ahead.
    pub fn align_print_time(&mut self, now_us: u32) {
        let cursor_clock = print_time_to_clock(self.print_time);
        let lead = timer_diff(cursor_clock, now_us);
        let min_lead = (SCHEDULE_AHEAD * 1_000_000.0) as i32;
        if lead < min_lead {
            self.print_time += (min_lead - lead) as f64 / 1_000_000.0;
        }
    }

    // ---- move admission ----

    /// Admit a move ending at `end` with the requested speed (mm/s).
    /// Sub-micrometre moves succeed as no-ops; endpoints beyond the soft
    /// limits are rejected whole.
    pub fn move_to(&mut self, end: Coord, speed: f64) -> Result<(), Error> {
        let (distance, axes_r) = calc_direction(&self.commanded_pos, &end);
        if distance < MIN_MOVE_DISTANCE {
            return Ok(());
        }
        let speed = if speed < 0.001 {
            self.config.max_velocity
        } else {
            speed.min(self.config.max_velocity)
        };
        for i in 0..3 {
            let p = end.axis(i);
            if p < self.config.min_pos[i] || p > self.config.max_pos[i] {
                return Err(Error::OutOfBounds);
            }
        }
        let pm = PlannerMove {
            start_pos: self.commanded_pos,
            end_pos: end,
            distance,
            axes_r,
            max_cruise_v: speed,
            max_start_v: speed,
            max_end_v: speed,
            start_v: 0.0,
            cruise_v: speed,
            end_v: 0.0,
        };
        if self.lookahead.push(pm).is_err() {
            // One flush, one retry.
            self.process_lookahead(0)?;
            self.lookahead.push(pm)?;
        }
        self.commanded_pos = end;
        if self.lookahead.len() >= LOOKAHEAD_DEPTH - 2 {
            self.process_lookahead(2)?;
        }
        Ok(())
    }

    /// Commit every pending move; the queue is left empty.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.process_lookahead(0)
    }

    pub fn has_moves(&self) -> bool {
        self.lookahead.len() > 0 || self.trapq.has_moves()
    }

    // ---- lookahead ----

    /// Permitted speed through the corner between two unit directions.
    /// Near-reversals stop; near-collinear joints pass at the incoming
    /// ceiling; in between, the approximated-centripetal bound applies.
    fn junction_velocity(&self, prev_dir: &Coord, next_dir: &Coord, max_v: f64) -> f64 {
        let dot = prev_dir.x * next_dir.x + prev_dir.y * next_dir.y + prev_dir.z * next_dir.z;
        if dot < -0.999 {
            return 0.0;
        }
        if dot > 0.999 {
            return max_v;
        }
        let sin_half_theta = libm::sqrt((1.0 - dot) * 0.5);
        let deviation =
            self.config.square_corner_velocity * self.config.square_corner_velocity
                / self.config.max_accel;
        let junction = libm::sqrt(self.config.max_accel * deviation / sin_half_theta);
        junction.min(max_v)
    }

    /// Run the two-pass velocity sweep and commit moves until only `keep`
    /// remain for future lookahead context.
    fn process_lookahead(&mut self, keep: usize) -> Result<(), Error> {
        let n = self.lookahead.len();
        if n == 0 {
            return Ok(());
        }
        // Backward sweep: ceiling on each entry velocity from the
        // successor chain (v^2 = v_next^2 + 2 a d) and the junction rule.
        self.lookahead.get_mut(n - 1).max_end_v = 0.0;
        for i in (1..n).rev() {
            let curr = *self.lookahead.get(i);
            let feasible =
                libm::sqrt(curr.max_end_v * curr.max_end_v
                    + 2.0 * self.config.max_accel * curr.distance);
            let mut entry = feasible.min(curr.max_cruise_v);
            let prev_dir = self.lookahead.get(i - 1).axes_r;
            entry = entry.min(self.junction_velocity(&prev_dir, &curr.axes_r, entry));
            self.lookahead.get_mut(i).max_start_v = entry;
            self.lookahead.get_mut(i - 1).max_end_v = entry;
        }
        // Forward sweep: realise velocities along the chain, entering at
        // the exit speed of the last committed segment.
        let accel = self.config.max_accel;
        let accel_to_decel = self.config.max_accel_to_decel;
        let mut prev_end_v = self.last_commit_end_v;
        for i in 0..n {
            let m = self.lookahead.get_mut(i);
            m.start_v = prev_end_v;
            let reachable =
                libm::sqrt(m.start_v * m.start_v + 2.0 * accel * m.distance);
            m.cruise_v = m.max_cruise_v.min(reachable);
            let exit_feasible =
                libm::sqrt(m.start_v * m.start_v + 2.0 * accel_to_decel * m.distance);
            m.end_v = m.max_end_v.min(exit_feasible).min(m.cruise_v);
            prev_end_v = m.end_v;
        }
        while self.lookahead.len() > keep {
            match self.lookahead.pop() {
                Some(m) => self.commit_move(&m)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Three-phase trapezoid for one move. When the accel and decel
    /// distances alone exceed the move, the peak velocity is lowered so
    /// the two phases exactly consume it and the cruise phase vanishes.
    fn trapezoid(
        &self,
        distance: f64,
        start_v: f64,
        cruise_v: f64,
        end_v: f64,
    ) -> (f64, f64, f64, f64) {
        let accel = self.config.max_accel;
        let mut accel_t = if cruise_v > start_v { (cruise_v - start_v) / accel } else { 0.0 };
        let mut decel_t = if cruise_v > end_v { (cruise_v - end_v) / accel } else { 0.0 };
        let accel_d = (start_v + cruise_v) * 0.5 * accel_t;
        let decel_d = (cruise_v + end_v) * 0.5 * decel_t;
        let cruise_d = distance - accel_d - decel_d;
        if cruise_d < 0.0 {
            let peak_sq = (start_v * start_v + end_v * end_v) * 0.5 + accel * distance;
            let peak = libm::sqrt(peak_sq).max(start_v).max(end_v);
            accel_t = if peak > start_v { (peak - start_v) / accel } else { 0.0 };
            decel_t = if peak > end_v { (peak - end_v) / accel } else { 0.0 };
            (accel_t, 0.0, decel_t, peak)
        } else {
            (accel_t, cruise_d / cruise_v, decel_t, cruise_v)
        }
    }

    fn commit_move(&mut self, m: &PlannerMove) -> Result<(), Error> {
        let (accel_t, cruise_t, decel_t, cruise_v) =
            self.trapezoid(m.distance, m.start_v, m.cruise_v, m.end_v);
        let mut res = self.trapq.append(
            self.print_time,
            accel_t,
            cruise_t,
            decel_t,
            m.start_pos,
            m.axes_r,
            m.start_v,
            cruise_v,
            self.config.max_accel,
        );
        if res == Err(Error::PoolExhausted) {
            // Reclaim stale history once, then retry.
            self.trapq.free_before(self.min_flush_time() - HISTORY_RETENTION);
            res = self.trapq.append(
                self.print_time,
                accel_t,
                cruise_t,
                decel_t,
                m.start_pos,
                m.axes_r,
                m.start_v,
                cruise_v,
                self.config.max_accel,
            );
        }
        res?;
        self.print_time += accel_t + cruise_t + decel_t;
        self.last_commit_end_v = m.end_v;
        self.current_pos = m.end_pos;
        trace!(
            "segment committed: d={} start_v={} cruise_v={} end_v={}",
            m.distance,
            m.start_v,
            cruise_v,
            m.end_v
        );
        Ok(())
    }

    // ---- step generation ----

    /// Drive the iterative solver for every axis up to `flush_time`,
    /// then retire fully consumed segments to history and prune stale
    /// history.
    pub fn generate_steps(&mut self, steppers: &mut [Stepper; 4], flush_time: f64) {
        let Toolhead { kin, trapq, .. } = self;
        for (sk, stepper) in kin.iter_mut().zip(steppers.iter_mut()) {
            if stepper.needs_clock_reset() && !stepper.is_moving() {
                stepper.reset_clock(print_time_to_clock(sk.last_flush_time()));
            }
            itersolve::generate_steps(sk, trapq, stepper, flush_time);
        }
        let done = self.min_flush_time();
        if done.is_finite() {
            self.trapq.finalize_before(done);
            self.trapq.free_before(done - HISTORY_RETENTION);
        }
    }

    // ---- homing ----

    /// Open a homing episode: relax the soft minima for the requested
    /// axes and return the overtravel target for the approach move.
    pub fn begin_homing(&mut self, axes: AxesMask) -> Coord {
        let saved = self.config.min_pos;
        self.saved_min_pos = Some(saved);
        let mut target = self.commanded_pos;
        let mut target_arr = target.as_array();
        for i in 0..3 {
            if axes.contains_axis(i) {
                self.config.min_pos[i] = -1e9;
                target_arr[i] = saved[i] - HOMING_MARGIN;
            }
        }
        target = Coord::from_array(target_arr);
        self.homing_state = HomingState::Fast;
        target
    }

    fn restore_limits(&mut self) {
        if let Some(saved) = self.saved_min_pos.take() {
            self.config.min_pos = saved;
        }
    }

    /// The approach leg triggered; limits return and the retract begins.
    pub fn finish_fast(&mut self) {
        self.restore_limits();
        self.homing_state = HomingState::Retract;
    }

    pub fn complete_homing(&mut self) {
        self.homing_state = HomingState::Done;
    }

    /// Abandon the episode after a timeout or admission failure.
    pub fn abort_homing(&mut self) {
        self.restore_limits();
        self.homing_state = HomingState::Error;
    }

    /// Drop motion that was committed but will never be executed: jump
    /// every axis cursor to the planner horizon and retire the segments.
    pub fn discard_pending(&mut self) {
        for sk in self.kin.iter_mut() {
            sk.skip_to(self.print_time);
        }
        self.trapq.finalize_before(self.print_time);
        self.current_pos = self.commanded_pos;
    }

    /// Re-origin one axis at zero after its endstop fired.
    pub fn zero_axis(&mut self, axis: usize, stepper: &mut Stepper) {
        let mut arr = self.commanded_pos.as_array();
        arr[axis] = 0.0;
        self.commanded_pos = Coord::from_array(arr);
        let mut cur = self.current_pos.as_array();
        cur[axis] = 0.0;
        self.current_pos = Coord::from_array(cur);
        self.kin[axis].set_position_mm(0.0);
        stepper.set_position(0);
    }
}

impl Default for Toolhead {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn xyz(x: f64, y: f64, z: f64) -> Coord {
        Coord::new(x, y, z, 0.0)
    }

    #[test]
    fn tiny_move_is_a_successful_noop() {
        let mut th = Toolhead::new();
        th.move_to(xyz(1e-8, 0.0, 0.0), 100.0).unwrap();
        assert_eq!(th.lookahead.len(), 0);
        assert_eq!(th.get_position(), Coord::default());
    }

    #[test]
    fn out_of_bounds_move_is_rejected_whole() {
        let mut th = Toolhead::new();
        let before = th.get_position();
        assert_eq!(th.move_to(xyz(500.0, 0.0, 0.0), 100.0), Err(Error::OutOfBounds));
        assert_eq!(th.get_position(), before);
        assert_eq!(th.lookahead.len(), 0);
    }

    #[test]
    fn single_move_profiles_from_rest_to_rest() {
        let mut th = Toolhead::new();
        th.move_to(xyz(10.0, 0.0, 0.0), 10.0).unwrap();
        th.flush().unwrap();
        assert_eq!(th.trapq.active_len(), 1);
        let m = th.trapq.first_move().unwrap();
        assert_approx_eq!(f64, m.start_v, 0.0);
        assert_approx_eq!(f64, m.cruise_v, 10.0);
        assert_approx_eq!(f64, m.end_v(), 0.0, epsilon = 1e-9);
        assert_approx_eq!(f64, m.distance_at(m.move_t()), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn collinear_moves_share_full_junction_speed() {
        let mut th = Toolhead::new();
        th.move_to(xyz(10.0, 0.0, 0.0), 100.0).unwrap();
        th.move_to(xyz(20.0, 0.0, 0.0), 100.0).unwrap();
        th.flush().unwrap();
        let moves: heapless::Vec<_, 4> = th.trapq.iter_active().collect();
        assert_eq!(moves.len(), 2);
        assert_approx_eq!(f64, moves[0].end_v(), moves[1].start_v, epsilon = 1e-6);
        assert_approx_eq!(f64, moves[0].end_v(), 100.0, epsilon = 1e-6);
        // Time continuity across the junction.
        assert_approx_eq!(f64, moves[0].end_time(), moves[1].print_time, epsilon = 1e-12);
    }

    #[test]
    fn right_angle_corner_is_capped() {
        let mut th = Toolhead::new();
        th.move_to(xyz(10.0, 0.0, 0.0), 100.0).unwrap();
        th.move_to(xyz(10.0, 10.0, 0.0), 100.0).unwrap();
        th.flush().unwrap();
        let moves: heapless::Vec<_, 4> = th.trapq.iter_active().collect();
        assert_eq!(moves.len(), 2);
        // c = 0: sin(theta/2) = sqrt(1/2), deviation = scv^2 / a.
        let deviation = SQUARE_CORNER_VELOCITY * SQUARE_CORNER_VELOCITY / MAX_ACCEL;
        let expect = libm::sqrt(MAX_ACCEL * deviation / libm::sqrt(0.5));
        assert_approx_eq!(f64, moves[0].end_v(), expect, epsilon = 1e-6);
        assert_approx_eq!(f64, moves[1].start_v, expect, epsilon = 1e-6);
    }

    #[test]
    fn reversal_comes_to_a_stop() {
        let mut th = Toolhead::new();
        th.move_to(xyz(10.0, 0.0, 0.0), 100.0).unwrap();
        th.move_to(xyz(0.0, 0.0, 0.0), 100.0).unwrap();
        th.flush().unwrap();
        let moves: heapless::Vec<_, 4> = th.trapq.iter_active().collect();
        assert_approx_eq!(f64, moves[0].end_v(), 0.0, epsilon = 1e-9);
        assert_approx_eq!(f64, moves[1].start_v, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn velocity_and_accel_caps_hold_over_a_burst() {
        let mut th = Toolhead::new();
        // A zig-zag across the bed; speeds request the configured max.
        for i in 1..=12 {
            let x = 10.0 * i as f64;
            let y = if i % 2 == 0 { 0.0 } else { 8.0 };
            th.move_to(xyz(x, y, 0.0), 500.0).unwrap();
        }
        th.flush().unwrap();
        let mut prev: Option<(f64, f64)> = None; // (end_time, end_v)
        for m in th.trapq.iter_active() {
            assert!(m.cruise_v <= MAX_VELOCITY + 1e-9);
            assert!(m.start_v <= MAX_VELOCITY + 1e-9);
            // Accel phases ramp at exactly the configured acceleration.
            assert!(2.0 * m.half_accel <= MAX_ACCEL + 1e-6);
            if let Some((pt, pv)) = prev {
                assert_approx_eq!(f64, m.print_time, pt, epsilon = 1e-9);
                assert_approx_eq!(f64, m.start_v, pv, epsilon = 1e-6);
            }
            prev = Some((m.end_time(), m.end_v()));
        }
    }

    #[test]
    fn short_move_lowers_cruise_to_a_triangle() {
        let mut th = Toolhead::new();
        // 0.5 mm at 200 mm/s cannot reach cruise.
        th.move_to(xyz(0.5, 0.0, 0.0), 200.0).unwrap();
        th.flush().unwrap();
        let m = th.trapq.first_move().unwrap();
        assert!(m.cruise_v < 200.0);
        assert_approx_eq!(f64, m.cruise_t, 0.0);
        assert_approx_eq!(f64, m.distance_at(m.move_t()), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn queue_full_flushes_and_retries() {
        let mut th = Toolhead::new();
        for i in 1..=40 {
            th.move_to(xyz((i % 200) as f64 + 1.0, ((i * 7) % 100) as f64, 0.0), 50.0)
                .unwrap();
        }
        // Lookahead never exceeds its ring; everything else was committed.
        assert!(th.lookahead.len() <= LOOKAHEAD_DEPTH);
    }

    #[test]
    fn homing_episode_walks_the_state_machine() {
        let mut th = Toolhead::new();
        assert_eq!(th.homing_state(), HomingState::Idle);
        let target = th.begin_homing(AxesMask::X);
        assert_eq!(th.homing_state(), HomingState::Fast);
        assert!(target.x < AXIS_MIN[0]);
        // Limits are relaxed for the approach, then restored.
        assert!(th.config.min_pos[0] < -1e8);
        th.finish_fast();
        assert_eq!(th.homing_state(), HomingState::Retract);
        assert_approx_eq!(f64, th.config.min_pos[0], AXIS_MIN[0]);
        th.complete_homing();
        assert_eq!(th.homing_state(), HomingState::Done);
    }

    #[test]
    fn set_position_round_trips_exactly() {
        let mut th = Toolhead::new();
        let mut steppers: [Stepper; 4] =
            core::array::from_fn(|i| Stepper::new(crate::config::STEPPER_PINS[i]));
        let pos = Coord::new(12.5, 3.25, 0.125, 1.0);
        th.set_position(&mut steppers, pos);
        assert_eq!(th.get_position(), pos);
        assert_eq!(steppers[0].position(), 1000);
    }
}
