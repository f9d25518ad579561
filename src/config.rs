//! Compile-time machine configuration: pin map, axis scales and limits,
//! motion tuning, thermal tuning, serial parameters.

use crate::hal::PinId;

/// Pack a GPIO bank (0 = A, 1 = B, ...) and bit index into a pin id.
pub const fn gpio(bank: u8, index: u8) -> PinId {
    bank * 16 + index
}

// ---------- Stepper pins ----------

#[derive(Debug, Copy, Clone)]
pub struct StepperPins {
    pub step: PinId,
    pub dir: PinId,
    pub enable: PinId,
    pub invert_step: bool,
    pub invert_dir: bool,
    pub invert_enable: bool,
}

pub const STEPPER_PINS: [StepperPins; 4] = [
    // X
    StepperPins { step: gpio(0, 0), dir: gpio(0, 1), enable: gpio(0, 2), invert_step: false, invert_dir: false, invert_enable: true },
    // Y
    StepperPins { step: gpio(0, 3), dir: gpio(0, 4), enable: gpio(0, 5), invert_step: false, invert_dir: false, invert_enable: true },
    // Z
    StepperPins { step: gpio(0, 6), dir: gpio(0, 7), enable: gpio(1, 0), invert_step: false, invert_dir: false, invert_enable: true },
    // E
    StepperPins { step: gpio(1, 1), dir: gpio(1, 2), enable: gpio(1, 3), invert_step: false, invert_dir: false, invert_enable: true },
];

// ---------- Endstop pins ----------

pub const ENDSTOP_PINS: [PinId; 3] = [gpio(2, 0), gpio(2, 1), gpio(2, 2)];
pub const ENDSTOP_INVERT: [bool; 3] = [false, false, false];

// ---------- Thermal pins ----------

pub const TEMP_HOTEND_ADC_CH: u8 = 0;
pub const TEMP_BED_ADC_CH: u8 = 1;

pub const HEATER_HOTEND_PIN: PinId = gpio(1, 4);
pub const HEATER_BED_PIN: PinId = gpio(1, 5);

pub const FAN_PART_PIN: PinId = gpio(1, 6);
pub const FAN_HOTEND_PIN: PinId = gpio(1, 7);

// Soft-PWM channel assignment, shared between heaters and fans.
pub const PWM_HEATER_HOTEND: usize = 0;
pub const PWM_HEATER_BED: usize = 1;
pub const PWM_FAN_PART: usize = 2;
pub const PWM_FAN_HOTEND: usize = 3;
pub const PWM_CHANNEL_COUNT: usize = 4;

// ---------- Motion parameters ----------

pub const STEPS_PER_MM: [f64; 4] = [80.0, 80.0, 400.0, 93.0];

/// mm/s
pub const MAX_VELOCITY: f64 = 200.0;
/// mm/s^2
pub const MAX_ACCEL: f64 = 3000.0;
/// Deceleration feasibility bound used by the lookahead exit-velocity chain.
pub const MAX_ACCEL_TO_DECEL: f64 = MAX_ACCEL * 0.5;
/// mm/s permitted through a square corner.
pub const SQUARE_CORNER_VELOCITY: f64 = 5.0;

/// Soft travel limits in mm; the extruder axis is unbounded.
pub const AXIS_MIN: [f64; 4] = [0.0, 0.0, 0.0, -1e9];
pub const AXIS_MAX: [f64; 4] = [220.0, 220.0, 250.0, 1e9];

/// Moves shorter than this are accepted as no-ops.
pub const MIN_MOVE_DISTANCE: f64 = 1e-6;

// ---------- Homing ----------

/// mm/s for the retract leg; the approach runs at twice this.
pub const HOMING_SPEED: f64 = 10.0;
/// mm retracted off the switch after the trigger; the axis ends here.
pub const HOMING_RETRACT: f64 = 5.0;
/// Seconds before an untriggered homing move is abandoned.
pub const HOMING_TIMEOUT: f64 = 30.0;
/// mm of overtravel past the soft minimum commanded during the approach.
pub const HOMING_MARGIN: f64 = 10.0;

// ---------- Step generation ----------

pub const LOOKAHEAD_DEPTH: usize = 16;
pub const MOVE_POOL_SIZE: usize = 32;
pub const STEP_QUEUE_DEPTH: usize = 64;

/// Hardware floor on the spacing of successive step edges on one axis.
pub const MIN_STEP_INTERVAL_US: u32 = 4;
/// Width of the step pulse itself. Driver-IC dependent.
pub const STEP_PULSE_US: u32 = 2;

/// How far (seconds) ahead of the scheduler clock freshly started motion
/// is placed, and how much history the trapq retains for position queries.
pub const SCHEDULE_AHEAD: f64 = 0.05;
pub const HISTORY_RETENTION: f64 = 1.0;

// ---------- Thermal parameters ----------

pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

pub const HOTEND_PID: PidGains = PidGains { kp: 22.2, ki: 1.08, kd: 114.0 };
pub const BED_PID: PidGains = PidGains { kp: 54.0, ki: 0.5, kd: 200.0 };

/// PID evaluation period, milliseconds.
pub const PID_PERIOD_MS: u32 = 100;
/// Clamp on the PID integral accumulator.
pub const PID_INTEGRAL_MAX: f32 = 100.0;
/// Target changes larger than this reset the PID state.
pub const PID_TARGET_RESET_DELTA: f32 = 10.0;
/// |current - target| tolerance for the at-target test (M109).
pub const TEMP_TOLERANCE: f32 = 3.0;

pub const HEATER_MAX_POWER: f32 = 1.0;

/// Soft-PWM timing: cycle length in µs and counter resolution.
pub const PWM_CYCLE_TIME_US: u32 = 1000;
pub const PWM_MAX_VALUE: u16 = 255;

// ---------- Endstop sampling ----------

pub const ENDSTOP_SAMPLE_INTERVAL_US: u32 = 1000;

// ---------- Serial ----------

pub const SERIAL_BAUD: u32 = 115_200;
pub const MAX_LINE_LEN: usize = 128;
pub const RX_BUFFER_SIZE: usize = 256;

// ---------- Boot defaults ----------

/// mm/min, applied until the first F parameter arrives.
pub const DEFAULT_FEEDRATE: f64 = 3000.0;
