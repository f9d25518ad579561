//! End-to-end motion scenarios: commanded moves all the way to step
//! edges on the simulated board, plus the homing episode.

mod common;

use common::{printer, take_output};
use float_cmp::assert_approx_eq;
use printcore::config::{ENDSTOP_PINS, HOMING_RETRACT, MIN_STEP_INTERVAL_US, STEPPER_PINS};
use printcore::toolhead::HomingState;

#[test]
fn single_axis_move_lands_on_target() {
    let mut p = printer();
    p.process_line("G90");
    p.process_line("G1 X10 F600");
    let out = take_output(&mut p);
    assert_eq!(out, "ok\r\nok\r\n");

    let pos = p.toolhead.get_position();
    assert_approx_eq!(f64, pos.x, 10.0);
    assert_approx_eq!(f64, pos.y, 0.0);

    p.wait_moves().unwrap();
    // 10 mm at 80 steps/mm.
    assert_eq!(p.steppers[0].position(), 800);
    assert_eq!(p.board.rise_count(STEPPER_PINS[0].step), 800);
    assert!(!p.steppers[0].is_moving());
}

#[test]
fn collinear_moves_execute_continuously() {
    let mut p = printer();
    p.process_line("G1 X10 F6000");
    p.process_line("G1 X20 F6000");
    p.wait_moves().unwrap();
    assert_eq!(p.steppers[0].position(), 1600);
}

#[test]
fn right_angle_corner_moves_both_axes() {
    let mut p = printer();
    p.process_line("G1 X10 F6000");
    p.process_line("G1 Y10 F6000");
    p.wait_moves().unwrap();
    assert_eq!(p.steppers[0].position(), 800);
    assert_eq!(p.steppers[1].position(), 800);
}

#[test]
fn step_edges_never_violate_the_minimum_interval() {
    let mut p = printer();
    // Full-speed sprint: 200 mm/s at 80 steps/mm is a 62.5 µs cadence.
    p.process_line("G1 X100 F12000");
    p.wait_moves().unwrap();
    assert_eq!(p.steppers[0].position(), 8000);
    let min_gap = p.board.min_rise_interval(STEPPER_PINS[0].step);
    assert!(
        min_gap >= MIN_STEP_INTERVAL_US,
        "saw step edges only {} µs apart",
        min_gap
    );
}

#[test]
fn extruder_only_move_steps_the_e_axis() {
    let mut p = printer();
    p.process_line("G1 E2 F300");
    p.wait_moves().unwrap();
    // 2 mm at 93 steps/mm.
    assert_eq!(p.steppers[3].position(), 186);
    assert_eq!(p.steppers[0].position(), 0);
}

#[test]
fn motion_survives_the_clock_wrap() {
    let mut p = printer();
    p.board.set_now(u32::MAX - 200_000);
    p.process_line("G1 X10 F600");
    p.wait_moves().unwrap();
    assert_eq!(p.steppers[0].position(), 800);
    assert!(p.board.min_rise_interval(STEPPER_PINS[0].step) >= MIN_STEP_INTERVAL_US);
}

#[test]
fn homing_triggers_stops_zeroes_and_retracts() {
    let mut p = printer();
    // The X switch closes 300 ms into the approach.
    p.board.set_input_high_at(ENDSTOP_PINS[0], 300_000);
    p.process_line("G28 X");
    let out = take_output(&mut p);
    assert_eq!(out, "ok\r\n");

    assert_eq!(p.toolhead.homing_state(), HomingState::Done);
    let pos = p.toolhead.get_position();
    assert_approx_eq!(f64, pos.x, HOMING_RETRACT);
    // The axis sits at the retract distance from the fresh origin.
    assert_eq!(p.steppers[0].position(), (HOMING_RETRACT * 80.0) as i32);
    assert!(!p.steppers[0].is_moving());
    assert!(!p.endstops.get(0).is_homing());
}

#[test]
fn homing_without_a_switch_times_out() {
    let mut p = printer();
    p.process_line("G28 X");
    let out = take_output(&mut p);
    assert_eq!(out, "error: execution failed\r\n");
    assert_eq!(p.toolhead.homing_state(), HomingState::Error);
    for s in p.steppers.iter() {
        assert!(!s.is_moving());
    }
    // Soft limits are back in force.
    assert_approx_eq!(f64, p.toolhead.config.min_pos[0], 0.0);
    assert!(!p.endstops.get(0).is_homing());
}

#[test]
fn homing_only_requested_axes() {
    let mut p = printer();
    p.board.set_input_high_at(ENDSTOP_PINS[1], 250_000);
    p.process_line("G28 Y");
    assert_eq!(take_output(&mut p), "ok\r\n");
    assert_approx_eq!(f64, p.toolhead.get_position().y, HOMING_RETRACT);
    // X was never part of the episode.
    assert_eq!(p.steppers[0].position(), 0);
    assert_eq!(p.toolhead.get_position().x, 0.0);
}

#[test]
fn moves_after_homing_are_bounded_again() {
    let mut p = printer();
    p.board.set_input_high_at(ENDSTOP_PINS[0], 200_000);
    p.process_line("G28 X");
    take_output(&mut p);
    p.process_line("G1 X-5 F600");
    assert_eq!(take_output(&mut p), "error: execution failed\r\n");
}
