//! Shared harness for the integration suites: a printer on the simulated
//! board and a helper to read back its serial output.

use printcore::sim::SimBoard;
use printcore::Printer;

pub fn printer() -> Printer<SimBoard> {
    Printer::new(SimBoard::new())
}

/// Drain and return everything the firmware wrote to the serial sink.
pub fn take_output(p: &mut Printer<SimBoard>) -> String {
    let s = String::from_utf8_lossy(p.board.output()).into_owned();
    p.board.clear_output();
    s
}
