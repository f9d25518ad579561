//! Thermistor reading and PID temperature control.
//!
//! A periodic task (100 ms) samples the heater's ADC channel, converts
//! the code to a temperature through a monotonic NTC lookup table with
//! linear interpolation, runs a PID step with integral clamping and
//! anti-windup, and writes the resulting duty to the heater's soft-PWM
//! channel. An ADC fault forces the output to zero for that cycle.

use crate::config::{
    PidGains, PID_INTEGRAL_MAX, PID_PERIOD_MS, PID_TARGET_RESET_DELTA, TEMP_TOLERANCE,
};
use crate::error::Error;
use crate::hal::Board;
use crate::pwm::SoftPwm;

/// (ADC code, temperature * 10) for a 100K NTC (beta 3950) behind a 4.7K
/// pull-up at 3.3 V on a 12-bit converter. Codes strictly increase,
/// temperatures strictly decrease.
const NTC_TABLE: [(u16, i16); 33] = [
    (23, 3000),
    (31, 2900),
    (41, 2800),
    (54, 2700),
    (71, 2600),
    (93, 2500),
    (120, 2400),
    (154, 2300),
    (196, 2200),
    (248, 2100),
    (311, 2000),
    (386, 1900),
    (475, 1800),
    (578, 1700),
    (696, 1600),
    (829, 1500),
    (976, 1400),
    (1136, 1300),
    (1307, 1200),
    (1486, 1100),
    (1670, 1000),
    (1855, 900),
    (2037, 800),
    (2213, 700),
    (2379, 600),
    (2534, 500),
    (2676, 400),
    (2804, 300),
    (2918, 200),
    (3018, 100),
    (3105, 0),
    (3180, -100),
    (3244, -200),
];

/// Warmest temperature the table can report (shorted-low sensor reads
/// clamp here).
pub const TEMP_MAX: f32 = NTC_TABLE[0].1 as f32 / 10.0;
/// Coldest temperature the table can report.
pub const TEMP_MIN: f32 = NTC_TABLE[NTC_TABLE.len() - 1].1 as f32 / 10.0;

/// Convert a raw 12-bit ADC code to degrees Celsius. Codes outside the
/// table clamp to the endpoint temperatures.
pub fn adc_to_temp(code: u16) -> f32 {
    if code < NTC_TABLE[0].0 {
        return TEMP_MAX;
    }
    if code > NTC_TABLE[NTC_TABLE.len() - 1].0 {
        return TEMP_MIN;
    }
    // Binary search for the largest row with table code <= input code.
    let mut lo = 0usize;
    let mut hi = NTC_TABLE.len() - 1;
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if NTC_TABLE[mid].0 <= code {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let i = lo.min(NTC_TABLE.len() - 2);
    let (c0, t0) = NTC_TABLE[i];
    let (c1, t1) = NTC_TABLE[i + 1];
    let ratio = (code - c0) as f32 / (c1 - c0) as f32;
    (t0 as f32 + ratio * (t1 - t0) as f32) / 10.0
}

pub struct Heater {
    adc_channel: u8,
    pwm_channel: usize,
    gains: &'static PidGains,
    max_power: f32,
    current_temp: f32,
    target_temp: f32,
    prev_error: f32,
    integral: f32,
    output: f32,
    pwm_enabled: bool,
}

impl Heater {
    pub fn new(
        adc_channel: u8,
        pwm_channel: usize,
        gains: &'static PidGains,
        max_power: f32,
    ) -> Self {
        Heater {
            adc_channel,
            pwm_channel,
            gains,
            max_power,
            current_temp: 0.0,
            target_temp: 0.0,
            prev_error: 0.0,
            integral: 0.0,
            output: 0.0,
            pwm_enabled: false,
        }
    }

    /// Change the target temperature. A jump of more than 10 °C resets
    /// the PID state; a target at or below zero shuts the output down.
    pub fn set_target<B: Board>(&mut self, board: &mut B, pwm: &mut SoftPwm, target: f32) {
        let target = target.clamp(0.0, TEMP_MAX);
        if libm::fabsf(target - self.target_temp) > PID_TARGET_RESET_DELTA {
            self.integral = 0.0;
            self.prev_error = 0.0;
        }
        self.target_temp = target;
        info!("heater target set to {}", target);
        if target <= 0.0 {
            self.integral = 0.0;
            self.prev_error = 0.0;
            self.output = 0.0;
            pwm.set_duty(self.pwm_channel, 0.0);
            pwm.enable(board, self.pwm_channel, false);
            self.pwm_enabled = false;
        } else if !self.pwm_enabled {
            pwm.enable(board, self.pwm_channel, true);
            self.pwm_enabled = true;
        }
    }

    pub fn target(&self) -> f32 {
        self.target_temp
    }

    pub fn current_temp(&self) -> f32 {
        self.current_temp
    }

    pub fn output(&self) -> f32 {
        self.output
    }

    pub fn pwm_enabled(&self) -> bool {
        self.pwm_enabled
    }

    /// Sample the sensor and update the cached temperature.
    pub fn read_temp<B: Board>(&mut self, board: &mut B) -> Result<f32, Error> {
        let code = board.adc_read(self.adc_channel).map_err(|_| Error::SensorInvalid)?;
        self.current_temp = adc_to_temp(code);
        Ok(self.current_temp)
    }

    /// Whether the measured temperature is within tolerance of the
    /// target. A disabled heater (target <= 0) always reports true.
    pub fn is_at_target(&self) -> bool {
        if self.target_temp <= 0.0 {
            return true;
        }
        libm::fabsf(self.current_temp - self.target_temp) <= TEMP_TOLERANCE
    }

    /// One PID step over `dt` seconds. Output is clamped to
    /// `[0, max_power]`; when the unclamped output saturates in the
    /// direction the error is pushing, this cycle's integral
    /// contribution is undone (anti-windup).
    fn pid_update(&mut self, dt: f32) -> f32 {
        let error = self.target_temp - self.current_temp;
        self.integral += error * dt;
        self.integral = self.integral.clamp(-PID_INTEGRAL_MAX, PID_INTEGRAL_MAX);
        let derivative = (error - self.prev_error) / dt;
        self.prev_error = error;
        let raw = self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        let bounded = raw.clamp(0.0, self.max_power);
        if (raw > self.max_power && error > 0.0) || (raw < 0.0 && error < 0.0) {
            self.integral -= error * dt;
        }
        self.output = bounded;
        bounded
    }

    /// Periodic control task. Runs every [`PID_PERIOD_MS`].
    pub fn tick<B: Board>(&mut self, board: &mut B, pwm: &mut SoftPwm) {
        let dt = PID_PERIOD_MS as f32 / 1000.0;
        if self.read_temp(board).is_err() {
            // Sensor fault: force the output safe for this cycle, leave
            // the target alone.
            warning!("heater adc read failed, output forced off");
            self.output = 0.0;
            pwm.set_duty(self.pwm_channel, 0.0);
            return;
        }
        if self.target_temp <= 0.0 {
            self.output = 0.0;
            pwm.set_duty(self.pwm_channel, 0.0);
            return;
        }
        let duty = self.pid_update(dt);
        pwm.set_duty(self.pwm_channel, duty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HOTEND_PID, PWM_HEATER_HOTEND};
    use crate::sim::SimBoard;
    use float_cmp::assert_approx_eq;

    fn make() -> (Heater, SoftPwm, SimBoard) {
        let mut board = SimBoard::new();
        let mut pwm = SoftPwm::new();
        pwm.configure(&mut board, PWM_HEATER_HOTEND, 20, false);
        let heater = Heater::new(0, PWM_HEATER_HOTEND, &HOTEND_PID, 1.0);
        (heater, pwm, board)
    }

    #[test]
    fn table_codes_increase_and_temps_decrease() {
        for pair in NTC_TABLE.windows(2) {
            assert!(pair[0].0 < pair[1].0);
            assert!(pair[0].1 > pair[1].1);
        }
    }

    #[test]
    fn out_of_range_codes_clamp_to_endpoints() {
        assert_approx_eq!(f32, adc_to_temp(0), 300.0);
        assert_approx_eq!(f32, adc_to_temp(4095), -20.0);
    }

    #[test]
    fn table_row_converts_exactly() {
        assert_approx_eq!(f32, adc_to_temp(1670), 100.0, epsilon = 0.01);
        assert_approx_eq!(f32, adc_to_temp(3105), 0.0, epsilon = 0.01);
    }

    #[test]
    fn interpolation_between_rows() {
        // Halfway between 2804 (30 C) and 2918 (20 C).
        let t = adc_to_temp(2861);
        assert!((t - 25.0).abs() < 0.1);
    }

    #[test]
    fn output_stays_in_range_and_saturates_high() {
        let (mut heater, mut pwm, mut board) = make();
        board.set_adc(0, 2804); // 30 C
        heater.set_target(&mut board, &mut pwm, 200.0);
        heater.tick(&mut board, &mut pwm);
        assert_approx_eq!(f32, heater.output(), 1.0);
        assert!(pwm.is_enabled(PWM_HEATER_HOTEND));
    }

    #[test]
    fn saturated_integral_does_not_wind_up() {
        let (mut heater, mut pwm, mut board) = make();
        board.set_adc(0, 2804); // 30 C
        heater.set_target(&mut board, &mut pwm, 200.0);
        for _ in 0..100 {
            heater.tick(&mut board, &mut pwm);
        }
        assert!(heater.integral.abs() <= PID_INTEGRAL_MAX);
        // With the error-sized contribution undone each saturated cycle
        // the integral stays near zero, not at the clamp.
        assert!(heater.integral.abs() < 1.0);
        // Once the temperature overshoots the target, the output drops
        // to zero within a few cycles.
        board.set_adc(0, 311); // ~200 C row
        heater.tick(&mut board, &mut pwm);
        board.set_adc(0, 248); // ~210 C
        for _ in 0..5 {
            heater.tick(&mut board, &mut pwm);
        }
        assert_approx_eq!(f32, heater.output(), 0.0);
    }

    #[test]
    fn zero_target_disables_pwm() {
        let (mut heater, mut pwm, mut board) = make();
        board.set_adc(0, 1670);
        heater.set_target(&mut board, &mut pwm, 200.0);
        assert!(heater.pwm_enabled());
        heater.set_target(&mut board, &mut pwm, 0.0);
        assert!(!heater.pwm_enabled());
        assert_approx_eq!(f32, heater.output(), 0.0);
        heater.tick(&mut board, &mut pwm);
        assert_approx_eq!(f32, heater.output(), 0.0);
    }

    #[test]
    fn large_target_change_resets_pid_state() {
        let (mut heater, mut pwm, mut board) = make();
        board.set_adc(0, 1670); // 100 C
        // A target close enough that the loop runs unsaturated and the
        // integral actually accumulates.
        heater.set_target(&mut board, &mut pwm, 100.04);
        for _ in 0..10 {
            heater.tick(&mut board, &mut pwm);
        }
        assert!(heater.integral != 0.0);
        heater.set_target(&mut board, &mut pwm, 200.0);
        assert_approx_eq!(f32, heater.integral, 0.0);
        assert_approx_eq!(f32, heater.prev_error, 0.0);
    }

    #[test]
    fn adc_fault_forces_output_off_for_the_cycle() {
        let (mut heater, mut pwm, mut board) = make();
        board.set_adc(0, 2804);
        heater.set_target(&mut board, &mut pwm, 200.0);
        heater.tick(&mut board, &mut pwm);
        assert!(heater.output() > 0.0);
        board.fail_adc(0);
        heater.tick(&mut board, &mut pwm);
        assert_approx_eq!(f32, heater.output(), 0.0);
        assert_approx_eq!(f32, heater.target(), 200.0);
        board.set_adc(0, 2804);
        heater.tick(&mut board, &mut pwm);
        assert!(heater.output() > 0.0);
    }

    #[test]
    fn at_target_tolerance_band() {
        let (mut heater, mut pwm, mut board) = make();
        board.set_adc(0, 1670); // 100 C
        heater.set_target(&mut board, &mut pwm, 102.0);
        heater.read_temp(&mut board).unwrap();
        assert!(heater.is_at_target());
        heater.set_target(&mut board, &mut pwm, 104.0);
        assert!(!heater.is_at_target());
        heater.set_target(&mut board, &mut pwm, 0.0);
        assert!(heater.is_at_target());
    }
}
