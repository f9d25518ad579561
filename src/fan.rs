//! Fan duty control over a soft-PWM channel.

use crate::hal::Board;
use crate::pwm::SoftPwm;

pub struct Fan {
    pwm_channel: usize,
    speed: f32,
    pwm_enabled: bool,
}

impl Fan {
    pub fn new(pwm_channel: usize) -> Self {
        Fan { pwm_channel, speed: 0.0, pwm_enabled: false }
    }

    /// Set the fan speed as a 0.0..=1.0 fraction; values outside the
    /// range clamp. Zero disables the channel and parks the pin at its
    /// inactive level; the channel is re-enabled lazily on the first
    /// non-zero duty.
    pub fn set_speed<B: Board>(&mut self, board: &mut B, pwm: &mut SoftPwm, speed: f32) {
        let speed = speed.clamp(0.0, 1.0);
        self.speed = speed;
        if speed <= 0.0 {
            pwm.set_duty(self.pwm_channel, 0.0);
            pwm.enable(board, self.pwm_channel, false);
            self.pwm_enabled = false;
        } else {
            if !self.pwm_enabled {
                pwm.enable(board, self.pwm_channel, true);
                self.pwm_enabled = true;
            }
            pwm.set_duty(self.pwm_channel, speed);
        }
        debug!("fan channel {} speed set to {}", self.pwm_channel as u8, speed);
    }

    /// Last commanded speed.
    pub fn speed(&self) -> f32 {
        self.speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBoard;
    use float_cmp::assert_approx_eq;

    fn make() -> (Fan, SoftPwm, SimBoard) {
        let mut board = SimBoard::new();
        let mut pwm = SoftPwm::new();
        pwm.configure(&mut board, 2, 22, false);
        (Fan::new(2), pwm, board)
    }

    #[test]
    fn speed_clamps_to_unit_range() {
        let (mut fan, mut pwm, mut board) = make();
        fan.set_speed(&mut board, &mut pwm, 1.8);
        assert_approx_eq!(f32, fan.speed(), 1.0);
        fan.set_speed(&mut board, &mut pwm, -0.5);
        assert_approx_eq!(f32, fan.speed(), 0.0);
    }

    #[test]
    fn zero_speed_disables_the_channel() {
        let (mut fan, mut pwm, mut board) = make();
        fan.set_speed(&mut board, &mut pwm, 0.7);
        assert!(pwm.is_enabled(2));
        fan.set_speed(&mut board, &mut pwm, 0.0);
        assert!(!pwm.is_enabled(2));
        assert!(!board.output_level(22));
    }

    #[test]
    fn m106_scaling_precision() {
        let (mut fan, mut pwm, mut board) = make();
        fan.set_speed(&mut board, &mut pwm, 127.0 / 255.0);
        assert!((fan.speed() - 127.0 / 255.0).abs() < 1e-3);
    }
}
