//! Software PWM: a single wheel timer toggles every enabled channel's
//! GPIO against a shared 8-bit counter. Used for the heater and fan
//! outputs, none of which need hardware-PWM frequencies.

use crate::config::{PWM_CHANNEL_COUNT, PWM_CYCLE_TIME_US, PWM_MAX_VALUE};
use crate::hal::{Board, PinId};

#[derive(Debug, Copy, Clone)]
struct SoftPwmChannel {
    pin: PinId,
    cycle_time: u32,
    max_value: u16,
    invert: bool,
    enabled: bool,
    value: u16,
}

impl SoftPwmChannel {
    const fn unconfigured() -> Self {
        SoftPwmChannel {
            pin: 0,
            cycle_time: PWM_CYCLE_TIME_US,
            max_value: PWM_MAX_VALUE,
            invert: false,
            enabled: false,
            value: 0,
        }
    }
}

pub struct SoftPwm {
    channels: [SoftPwmChannel; PWM_CHANNEL_COUNT],
    counter: u16,
    configured: [bool; PWM_CHANNEL_COUNT],
}

impl SoftPwm {
    pub const fn new() -> Self {
        SoftPwm {
            channels: [SoftPwmChannel::unconfigured(); PWM_CHANNEL_COUNT],
            counter: 0,
            configured: [false; PWM_CHANNEL_COUNT],
        }
    }

    pub fn configure<B: Board>(&mut self, board: &mut B, idx: usize, pin: PinId, invert: bool) {
        let ch = &mut self.channels[idx];
        ch.pin = pin;
        ch.invert = invert;
        ch.enabled = false;
        ch.value = 0;
        self.configured[idx] = true;
        board.gpio_out_write(pin, invert);
    }

    /// Enable or disable a channel. Disabling drives the pin to its
    /// inactive level immediately.
    pub fn enable<B: Board>(&mut self, board: &mut B, idx: usize, on: bool) {
        let ch = &mut self.channels[idx];
        ch.enabled = on;
        if !on {
            board.gpio_out_write(ch.pin, ch.invert);
        }
    }

    pub fn is_enabled(&self, idx: usize) -> bool {
        self.channels[idx].enabled
    }

    /// True when at least one channel needs the tick timer running.
    pub fn any_enabled(&self) -> bool {
        self.channels.iter().any(|c| c.enabled)
    }

    /// Set a channel's duty as a 0.0..=1.0 fraction.
    pub fn set_duty(&mut self, idx: usize, duty: f32) {
        let ch = &mut self.channels[idx];
        let duty = duty.clamp(0.0, 1.0);
        ch.value = (duty * ch.max_value as f32) as u16;
    }

    pub fn get_duty(&self, idx: usize) -> f32 {
        let ch = &self.channels[idx];
        ch.value as f32 / ch.max_value as f32
    }

    /// Tick interval of the shared counter, set by the fastest channel.
    pub fn tick_interval(&self) -> u32 {
        let cycle = self
            .channels
            .iter()
            .map(|c| c.cycle_time)
            .min()
            .unwrap_or(PWM_CYCLE_TIME_US);
        (cycle / PWM_MAX_VALUE as u32).max(1)
    }

    /// Timer callback: advance the counter and drive every enabled pin.
    pub fn on_timer<B: Board>(&mut self, board: &mut B, waketime: u32) -> u32 {
        self.counter = (self.counter + 1) % (PWM_MAX_VALUE + 1);
        for (idx, ch) in self.channels.iter().enumerate() {
            if !self.configured[idx] || !ch.enabled {
                continue;
            }
            let out = self.counter < ch.value;
            board.gpio_out_write(ch.pin, out != ch.invert);
        }
        waketime.wrapping_add(self.tick_interval())
    }
}

impl Default for SoftPwm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBoard;
    use float_cmp::assert_approx_eq;

    #[test]
    fn duty_is_clamped_and_reported() {
        let mut board = SimBoard::new();
        let mut pwm = SoftPwm::new();
        pwm.configure(&mut board, 0, 40, false);
        pwm.set_duty(0, 1.5);
        assert_approx_eq!(f32, pwm.get_duty(0), 1.0);
        pwm.set_duty(0, -0.2);
        assert_approx_eq!(f32, pwm.get_duty(0), 0.0);
    }

    #[test]
    fn disable_drives_pin_inactive() {
        let mut board = SimBoard::new();
        let mut pwm = SoftPwm::new();
        pwm.configure(&mut board, 0, 40, false);
        pwm.enable(&mut board, 0, true);
        pwm.set_duty(0, 1.0);
        pwm.on_timer(&mut board, 0);
        assert!(board.output_level(40));
        pwm.enable(&mut board, 0, false);
        assert!(!board.output_level(40));
    }

    #[test]
    fn duty_fraction_matches_high_time() {
        let mut board = SimBoard::new();
        let mut pwm = SoftPwm::new();
        pwm.configure(&mut board, 0, 40, false);
        pwm.enable(&mut board, 0, true);
        pwm.set_duty(0, 0.5);
        let mut high = 0u32;
        let cycle = PWM_MAX_VALUE as u32 + 1;
        let mut wake = 0u32;
        for _ in 0..cycle {
            wake = pwm.on_timer(&mut board, wake);
            if board.output_level(40) {
                high += 1;
            }
        }
        let frac = high as f32 / cycle as f32;
        assert!((frac - 0.5).abs() < 0.02);
    }

    #[test]
    fn inverted_channel_idles_high() {
        let mut board = SimBoard::new();
        let mut pwm = SoftPwm::new();
        pwm.configure(&mut board, 1, 41, true);
        assert!(board.output_level(41));
        pwm.enable(&mut board, 1, true);
        pwm.enable(&mut board, 1, false);
        assert!(board.output_level(41));
    }
}
