//! Time-ordered timer list for the cooperative main loop.
//!
//! Timers are statically registered slots addressed by [`TimerHandle`];
//! the list itself is an intrusive chain of slot indices ordered by wake
//! time, so scheduling never allocates. Dispatch is cooperative: the main
//! loop pops due timers one at a time, runs the owning subsystem's
//! callback, and re-inserts if the callback asks for another wake-up.

/// Index of a registered timer slot.
pub type TimerHandle = usize;

/// Wrap-aware "t1 is strictly before t2" on the 32-bit microsecond clock.
/// Valid for separations below 2^31 µs (about 35 minutes).
#[inline]
pub fn timer_is_before(t1: u32, t2: u32) -> bool {
    (t1.wrapping_sub(t2) as i32) < 0
}

/// Signed difference t1 - t2 on the wrapping clock.
#[inline]
pub fn timer_diff(t1: u32, t2: u32) -> i32 {
    t1.wrapping_sub(t2) as i32
}

/// Convert a microsecond count to clock ticks. The scheduler clock runs
/// at 1 MHz so this is the identity; kept as the single conversion point
/// should a port choose a faster tick.
#[inline]
pub fn timer_from_us(us: u32) -> u32 {
    us
}

#[derive(Debug, Copy, Clone)]
struct TimerSlot {
    waketime: u32,
    next: Option<TimerHandle>,
    pending: bool,
}

impl TimerSlot {
    const fn new() -> Self {
        TimerSlot { waketime: 0, next: None, pending: false }
    }
}

/// Ordered set of `N` timers. Insert and cancel are O(n) walks of the
/// chain; with a handful of timers per machine that is cheaper than any
/// heap structure and needs no allocation.
pub struct TimerWheel<const N: usize> {
    slots: [TimerSlot; N],
    head: Option<TimerHandle>,
}

impl<const N: usize> TimerWheel<N> {
    pub const fn new() -> Self {
        TimerWheel { slots: [TimerSlot::new(); N], head: None }
    }

    /// Schedule `handle` at `waketime`. A timer appears in the wheel at
    /// most once: re-inserting an already pending timer moves it.
    pub fn insert(&mut self, handle: TimerHandle, waketime: u32) {
        if self.slots[handle].pending {
            self.unlink(handle);
        }
        self.slots[handle].waketime = waketime;
        self.slots[handle].pending = true;

        // Walk to the first entry strictly later than us.
        let mut prev: Option<TimerHandle> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if timer_is_before(waketime, self.slots[c].waketime) {
                break;
            }
            prev = cur;
            cur = self.slots[c].next;
        }
        self.slots[handle].next = cur;
        match prev {
            Some(p) => self.slots[p].next = Some(handle),
            None => self.head = Some(handle),
        }
    }

    /// Remove `handle` from the wheel if it is queued.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if self.slots[handle].pending {
            self.unlink(handle);
        }
    }

    fn unlink(&mut self, handle: TimerHandle) {
        let mut prev: Option<TimerHandle> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == handle {
                match prev {
                    Some(p) => self.slots[p].next = self.slots[c].next,
                    None => self.head = self.slots[c].next,
                }
                self.slots[c].next = None;
                self.slots[c].pending = false;
                return;
            }
            prev = cur;
            cur = self.slots[c].next;
        }
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.slots[handle].pending
    }

    /// Wake time of the earliest queued timer, if any.
    pub fn next_wake(&self) -> Option<u32> {
        self.head.map(|h| self.slots[h].waketime)
    }

    /// Unlink and return the head timer if it is due at `now`. The caller
    /// runs the callback and re-inserts on a non-zero reschedule, so a
    /// self-rescheduling timer cannot starve its successors.
    pub fn pop_due(&mut self, now: u32) -> Option<(TimerHandle, u32)> {
        let head = self.head?;
        let waketime = self.slots[head].waketime;
        if timer_is_before(now, waketime) {
            return None;
        }
        self.head = self.slots[head].next;
        self.slots[head].next = None;
        self.slots[head].pending = false;
        Some((head, waketime))
    }
}
