//! Trapezoidal motion queue: the ordered list of committed motion
//! segments the step generator consumes, plus a short history retained
//! for position queries of the recent past.
//!
//! Segments live in a fixed pool and the active/history lists are chains
//! of slot indices, keeping ownership rooted in the queue itself.

use crate::config::{HISTORY_RETENTION, MOVE_POOL_SIZE};
use crate::error::Error;
use crate::pool::Pool;

/// Four-component machine coordinate, millimetres.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

impl Coord {
    pub const fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Coord { x, y, z, e }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.x, self.y, self.z, self.e]
    }

    pub fn from_array(a: [f64; 4]) -> Self {
        Coord { x: a[0], y: a[1], z: a[2], e: a[3] }
    }

    /// Component for a numeric axis index (0=X .. 3=E).
    pub fn axis(&self, axis: usize) -> f64 {
        match axis {
            0 => self.x,
            1 => self.y,
            2 => self.z,
            _ => self.e,
        }
    }
}

/// One committed planner segment: a three-phase trapezoid in time,
/// travelling along a fixed 4D unit direction from `start_pos`. The
/// extruder component participates in the arc length, so a retract-only
/// move is a well-formed segment.
#[derive(Debug, Copy, Clone, Default)]
pub struct Move {
    pub print_time: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    pub start_v: f64,
    pub cruise_v: f64,
    pub half_accel: f64,
    pub start_pos: Coord,
    pub axes_r: Coord,
}

impl Move {
    pub fn move_t(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }

    pub fn end_time(&self) -> f64 {
        self.print_time + self.move_t()
    }

    /// Exit velocity implied by the profile.
    pub fn end_v(&self) -> f64 {
        self.cruise_v - 2.0 * self.half_accel * self.decel_t
    }

    /// Arc distance travelled `move_time` seconds into the segment.
    /// Piecewise per phase; C1 within each phase and velocity-continuous
    /// at the phase boundaries by construction.
    pub fn distance_at(&self, move_time: f64) -> f64 {
        let mut t = move_time.clamp(0.0, self.move_t());
        let mut dist = 0.0;
        if t > 0.0 && self.accel_t > 0.0 {
            let at = t.min(self.accel_t);
            dist += self.start_v * at + self.half_accel * at * at;
            t -= at;
        }
        if t > 0.0 && self.cruise_t > 0.0 {
            let ct = t.min(self.cruise_t);
            dist += self.cruise_v * ct;
            t -= ct;
        }
        if t > 0.0 && self.decel_t > 0.0 {
            let dt = t.min(self.decel_t);
            dist += self.cruise_v * dt - self.half_accel * dt * dt;
        }
        dist
    }

    /// Machine position `move_time` seconds into the segment.
    pub fn coord_at(&self, move_time: f64) -> Coord {
        let dist = self.distance_at(move_time);
        Coord {
            x: self.start_pos.x + self.axes_r.x * dist,
            y: self.start_pos.y + self.axes_r.y * dist,
            z: self.start_pos.z + self.axes_r.z * dist,
            e: self.start_pos.e + self.axes_r.e * dist,
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
struct MoveList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

fn list_push_tail(list: &mut MoveList, links: &mut [Option<usize>], idx: usize) {
    links[idx] = None;
    match list.tail {
        Some(t) => links[t] = Some(idx),
        None => list.head = Some(idx),
    }
    list.tail = Some(idx);
    list.len += 1;
}

fn list_pop_head(list: &mut MoveList, links: &mut [Option<usize>]) -> Option<usize> {
    let head = list.head?;
    list.head = links[head];
    if list.head.is_none() {
        list.tail = None;
    }
    links[head] = None;
    list.len -= 1;
    Some(head)
}

/// The trapezoidal queue itself.
pub struct TrapQ {
    pool: Pool<Move, MOVE_POOL_SIZE>,
    links: [Option<usize>; MOVE_POOL_SIZE],
    active: MoveList,
    history: MoveList,
}

impl TrapQ {
    pub fn new() -> Self {
        TrapQ {
            pool: Pool::new(),
            links: [None; MOVE_POOL_SIZE],
            active: MoveList::default(),
            history: MoveList::default(),
        }
    }

    /// Append a segment built from the planner's trapezoid parameters.
    ///
    /// When the active list is non-empty the new segment must start where
    /// the previous one ends; a start time in the future of that point
    /// (motion resuming after idle) is bridged with a zero-velocity
    /// filler so the active list stays contiguous on the time line.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        print_time: f64,
        accel_t: f64,
        cruise_t: f64,
        decel_t: f64,
        start_pos: Coord,
        axes_r: Coord,
        start_v: f64,
        cruise_v: f64,
        accel: f64,
    ) -> Result<(), Error> {
        if let Some(tail) = self.active.tail {
            let prev_end = self.pool.get(tail).map(|m| m.end_time()).unwrap_or(print_time);
            if print_time > prev_end + 1e-12 {
                let filler = Move {
                    print_time: prev_end,
                    cruise_t: print_time - prev_end,
                    start_pos,
                    ..Move::default()
                };
                let idx = self.pool.claim(filler)?;
                list_push_tail(&mut self.active, &mut self.links, idx);
            } else {
                debug_assert!(print_time >= prev_end - 1e-9);
            }
        }
        let m = Move {
            print_time,
            accel_t,
            cruise_t,
            decel_t,
            start_v,
            cruise_v,
            half_accel: 0.5 * accel,
            start_pos,
            axes_r,
        };
        let idx = self.pool.claim(m)?;
        list_push_tail(&mut self.active, &mut self.links, idx);
        Ok(())
    }

    /// Move every active segment fully in the past of `print_time` to the
    /// history list.
    pub fn finalize_before(&mut self, print_time: f64) {
        while let Some(head) = self.active.head {
            let end = match self.pool.get(head) {
                Some(m) => m.end_time(),
                None => break,
            };
            if end > print_time {
                break;
            }
            match list_pop_head(&mut self.active, &mut self.links) {
                Some(idx) => list_push_tail(&mut self.history, &mut self.links, idx),
                None => break,
            }
        }
    }

    /// Drop history segments that ended before `print_time`.
    pub fn free_before(&mut self, print_time: f64) {
        while let Some(head) = self.history.head {
            let end = match self.pool.get(head) {
                Some(m) => m.end_time(),
                None => break,
            };
            if end >= print_time {
                break;
            }
            match list_pop_head(&mut self.history, &mut self.links) {
                Some(idx) => {
                    self.pool.release(idx);
                }
                None => break,
            }
        }
    }

    /// Prune history older than the retention margin behind `print_time`.
    pub fn prune(&mut self, print_time: f64) {
        self.free_before(print_time - HISTORY_RETENTION);
    }

    /// Machine position at absolute print time `t`, searching the active
    /// list first and then the history.
    pub fn position_at(&self, t: f64) -> Option<Coord> {
        for m in self.iter_active().chain(self.iter_history()) {
            if t >= m.print_time && t <= m.end_time() {
                return Some(m.coord_at(t - m.print_time));
            }
        }
        None
    }

    pub fn has_moves(&self) -> bool {
        self.active.len > 0
    }

    pub fn active_len(&self) -> usize {
        self.active.len
    }

    pub fn history_len(&self) -> usize {
        self.history.len
    }

    pub fn first_move(&self) -> Option<&Move> {
        self.active.head.and_then(|i| self.pool.get(i))
    }

    pub fn last_move(&self) -> Option<&Move> {
        self.active.tail.and_then(|i| self.pool.get(i))
    }

    /// End time of the last active segment, if any.
    pub fn active_end_time(&self) -> Option<f64> {
        self.last_move().map(|m| m.end_time())
    }

    pub fn iter_active(&self) -> MoveIter<'_> {
        MoveIter { tq: self, cur: self.active.head }
    }

    pub fn iter_history(&self) -> MoveIter<'_> {
        MoveIter { tq: self, cur: self.history.head }
    }
}

impl Default for TrapQ {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MoveIter<'a> {
    tq: &'a TrapQ,
    cur: Option<usize>,
}

impl<'a> Iterator for MoveIter<'a> {
    type Item = &'a Move;

    fn next(&mut self) -> Option<&'a Move> {
        let idx = self.cur?;
        self.cur = self.tq.links[idx];
        self.tq.pool.get(idx)
    }
}
