//! Simulated board for host-side testing.
//!
//! Stands in for the hardware port: a virtual microsecond clock that
//! jumps forward on `idle_until`, scripted input pins and ADC codes, a
//! captured serial sink, and per-pin edge statistics so tests can check
//! step timing invariants without recording every edge.

use crate::hal::{AdcError, Board, PinId};

const PIN_COUNT: usize = 256;
const ADC_COUNT: usize = 16;
const TX_CAPACITY: usize = 4096;

pub struct SimBoard {
    now: u32,
    levels: [bool; PIN_COUNT],
    inputs: [bool; PIN_COUNT],
    /// Scripted assertion: the input reads high once the clock passes
    /// the stored time.
    input_high_at: [Option<u32>; PIN_COUNT],
    adc: [Option<u16>; ADC_COUNT],
    tx: heapless::Vec<u8, TX_CAPACITY>,
    rise_count: [u32; PIN_COUNT],
    last_rise: [Option<u32>; PIN_COUNT],
    min_rise_interval: [u32; PIN_COUNT],
}

impl SimBoard {
    pub fn new() -> Self {
        SimBoard {
            now: 0,
            levels: [false; PIN_COUNT],
            inputs: [false; PIN_COUNT],
            input_high_at: [None; PIN_COUNT],
            adc: [None; ADC_COUNT],
            tx: heapless::Vec::new(),
            rise_count: [0; PIN_COUNT],
            last_rise: [None; PIN_COUNT],
            min_rise_interval: [u32::MAX; PIN_COUNT],
        }
    }

    // ---- clock control ----

    pub fn set_now(&mut self, t: u32) {
        self.now = t;
    }

    pub fn advance(&mut self, us: u32) {
        self.now = self.now.wrapping_add(us);
    }

    // ---- scripted stimuli ----

    pub fn set_input(&mut self, pin: PinId, high: bool) {
        self.inputs[pin as usize] = high;
        self.input_high_at[pin as usize] = None;
    }

    /// Make the input read high once the clock reaches `t`.
    pub fn set_input_high_at(&mut self, pin: PinId, t: u32) {
        self.input_high_at[pin as usize] = Some(t);
    }

    pub fn set_adc(&mut self, channel: u8, code: u16) {
        self.adc[channel as usize] = Some(code);
    }

    /// Make subsequent reads of the channel fail.
    pub fn fail_adc(&mut self, channel: u8) {
        self.adc[channel as usize] = None;
    }

    // ---- observations ----

    pub fn output_level(&self, pin: PinId) -> bool {
        self.levels[pin as usize]
    }

    pub fn output(&self) -> &[u8] {
        &self.tx
    }

    pub fn clear_output(&mut self) {
        self.tx.clear();
    }

    /// Number of rising edges observed on the pin.
    pub fn rise_count(&self, pin: PinId) -> u32 {
        self.rise_count[pin as usize]
    }

    /// Smallest spacing observed between two rising edges on the pin.
    pub fn min_rise_interval(&self, pin: PinId) -> u32 {
        self.min_rise_interval[pin as usize]
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for SimBoard {
    fn now_us(&self) -> u32 {
        self.now
    }

    fn gpio_out_write(&mut self, pin: PinId, high: bool) {
        let idx = pin as usize;
        if high && !self.levels[idx] {
            self.rise_count[idx] += 1;
            if let Some(prev) = self.last_rise[idx] {
                let gap = self.now.wrapping_sub(prev);
                if gap < self.min_rise_interval[idx] {
                    self.min_rise_interval[idx] = gap;
                }
            }
            self.last_rise[idx] = Some(self.now);
        }
        self.levels[idx] = high;
    }

    fn gpio_in_read(&self, pin: PinId) -> bool {
        let idx = pin as usize;
        if let Some(t) = self.input_high_at[idx] {
            if crate::sched::timer_diff(self.now, t) >= 0 {
                return true;
            }
        }
        self.inputs[idx]
    }

    fn adc_read(&mut self, channel: u8) -> Result<u16, AdcError> {
        self.adc[channel as usize].ok_or(AdcError::ReadFault)
    }

    fn serial_write(&mut self, data: &[u8]) {
        for &b in data {
            // Oldest output is dropped once the capture fills; tests
            // drain it between commands.
            let _ = self.tx.push(b);
        }
    }

    fn delay_us(&mut self, us: u32) {
        self.now = self.now.wrapping_add(us);
    }

    fn idle_until(&mut self, wake: u32) {
        if crate::sched::timer_is_before(self.now, wake) {
            self.now = wake;
        }
    }
}
