//! Part-fan control over the serial protocol.

mod common;

use common::{printer, take_output};
use printcore::config::FAN_PART_PIN;
use printcore::printer::FAN_PART;

#[test]
fn m106_scales_the_s_parameter() {
    let mut p = printer();
    p.process_line("M106 S127");
    assert_eq!(take_output(&mut p), "ok\r\n");
    assert!((p.fans[FAN_PART].speed() - 127.0 / 255.0).abs() < 1e-3);
}

#[test]
fn m106_without_s_means_full_speed() {
    let mut p = printer();
    p.process_line("M106");
    take_output(&mut p);
    assert_eq!(p.fans[FAN_PART].speed(), 1.0);
}

#[test]
fn out_of_range_s_clamps() {
    let mut p = printer();
    p.process_line("M106 S400");
    assert_eq!(p.fans[FAN_PART].speed(), 1.0);
    p.process_line("M106 S-20");
    assert_eq!(p.fans[FAN_PART].speed(), 0.0);
}

#[test]
fn m107_stops_the_fan_and_parks_the_pin() {
    let mut p = printer();
    p.process_line("M106 S255");
    p.run_for(10_000);
    assert!(p.board.rise_count(FAN_PART_PIN) > 0);
    p.process_line("M107");
    assert_eq!(p.fans[FAN_PART].speed(), 0.0);
    assert!(!p.board.output_level(FAN_PART_PIN));
    take_output(&mut p);
}

#[test]
fn fan_speed_survives_other_commands() {
    let mut p = printer();
    p.process_line("M106 S64");
    p.process_line("G90");
    p.process_line("M104 S0");
    assert!((p.fans[FAN_PART].speed() - 64.0 / 255.0).abs() < 1e-3);
}
