//! Kinematic projections from machine coordinates to stepper step
//! positions. Only Cartesian geometry is supported: each stepper maps to
//! exactly one axis.

pub mod cartesian;

pub use cartesian::{axis_name, Axis};
