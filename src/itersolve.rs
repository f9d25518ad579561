//! Iterative step-time solver: maps the trapezoidal queue's continuous
//! motion into per-axis step edge times.
//!
//! For each axis the solver walks the active segments between its last
//! flush point and the requested flush boundary, finds the print time at
//! which the axis projection crosses each successive whole-step index
//! (bisection bracketed by the segment bounds, refined by Newton-Raphson,
//! falling back to pure bisection when the local derivative vanishes) and
//! hands the edge to the stepper driver.

use crate::kinematics::cartesian::{project, Axis};
use crate::stepper::Stepper;
use crate::trapq::{Move, TrapQ};

/// Iteration stops when the projected position is within this many steps
/// of the target.
const SOLVE_TOLERANCE: f64 = 1e-9;
/// Hard cap on solver iterations per step.
const MAX_SOLVE_ITERATIONS: usize = 50;
/// Finite-difference width for the Newton derivative estimate.
const DERIV_DT: f64 = 1e-6;

/// Print time (seconds, double) to scheduler clock (µs, wrapping u32).
/// This is the only point where planner time is converted to stepper
/// time.
#[inline]
pub fn print_time_to_clock(t: f64) -> u32 {
    (t * 1_000_000.0 + 0.5) as u64 as u32
}

/// Per-axis solver state.
pub struct StepperKinematics {
    axis: Axis,
    steps_per_mm: f64,
    /// Commanded step index, fractional between steps.
    step_pos: f64,
    /// Print time up to which steps have been generated.
    last_flush_time: f64,
}

impl StepperKinematics {
    pub fn new(axis: Axis, steps_per_mm: f64) -> Self {
        StepperKinematics { axis, steps_per_mm, step_pos: 0.0, last_flush_time: 0.0 }
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn steps_per_mm(&self) -> f64 {
        self.steps_per_mm
    }

    /// Set the commanded position in millimetres.
    pub fn set_position_mm(&mut self, pos_mm: f64) {
        self.step_pos = pos_mm * self.steps_per_mm;
    }

    pub fn position_mm(&self) -> f64 {
        self.step_pos / self.steps_per_mm
    }

    pub fn last_flush_time(&self) -> f64 {
        self.last_flush_time
    }

    /// Advance the cursor without emitting steps; used when queued motion
    /// is abandoned (homing stop).
    pub fn skip_to(&mut self, time: f64) {
        if time > self.last_flush_time {
            self.last_flush_time = time;
        }
    }

    fn project_at(&self, m: &Move, t_abs: f64) -> f64 {
        project(&m.coord_at(t_abs - m.print_time), self.axis, self.steps_per_mm)
    }

    /// Print time within `[lo, hi]` of segment `m` at which the
    /// projection equals `target`.
    fn solve_step_time(&self, m: &Move, target: f64, mut lo: f64, mut hi: f64) -> f64 {
        let mut f_lo = self.project_at(m, lo) - target;
        let mut t = 0.5 * (lo + hi);
        for _ in 0..MAX_SOLVE_ITERATIONS {
            let pos = self.project_at(m, t);
            let f_t = pos - target;
            if libm::fabs(f_t) < SOLVE_TOLERANCE {
                return t;
            }
            if (f_t > 0.0) == (f_lo > 0.0) {
                lo = t;
                f_lo = f_t;
            } else {
                hi = t;
            }
            let deriv = (self.project_at(m, t + DERIV_DT) - pos) / DERIV_DT;
            if libm::fabs(deriv) < 1e-12 {
                t = 0.5 * (lo + hi);
            } else {
                let refined = t - f_t / deriv;
                t = if refined <= lo || refined >= hi {
                    0.5 * (lo + hi)
                } else {
                    refined
                };
            }
        }
        t
    }
}

/// Generate step edges for one axis up to `flush_time`, feeding the
/// stepper's run queue. Returns early (with the cursor parked at the last
/// emitted edge) when the stepper queue fills; the caller re-invokes
/// after the queue drains.
pub fn generate_steps(
    sk: &mut StepperKinematics,
    tq: &TrapQ,
    stepper: &mut Stepper,
    flush_time: f64,
) {
    if flush_time <= sk.last_flush_time {
        return;
    }
    let mut cursor = sk.last_flush_time;
    for m in tq.iter_active() {
        let move_end = m.end_time();
        if move_end <= cursor {
            continue;
        }
        if m.print_time >= flush_time {
            break;
        }
        let seg_start = if cursor > m.print_time { cursor } else { m.print_time };
        let seg_end = if flush_time < move_end { flush_time } else { move_end };
        let start_pos = sk.project_at(m, seg_start);
        let end_pos = sk.project_at(m, seg_end);
        // The trapezoid is monotone in arc length and the projection is
        // linear, so the direction sign holds for the whole segment.
        let sdir: i8 = if end_pos >= start_pos { 1 } else { -1 };
        let mut t_lo = seg_start;
        loop {
            let target = if sdir > 0 {
                libm::floor(sk.step_pos) + 1.0
            } else {
                libm::ceil(sk.step_pos) - 1.0
            };
            if (sdir > 0 && target > end_pos) || (sdir < 0 && target < end_pos) {
                break;
            }
            let t_step = sk.solve_step_time(m, target, t_lo, seg_end);
            if stepper.queue_step(print_time_to_clock(t_step), sdir).is_err() {
                sk.last_flush_time = t_lo;
                return;
            }
            sk.step_pos = target;
            t_lo = t_step;
        }
        cursor = seg_end;
        if move_end > flush_time {
            break;
        }
    }
    sk.last_flush_time = flush_time;
}
