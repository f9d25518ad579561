//! Command records, the line parser, and the dispatcher.
//!
//! A parsed line becomes one [`Command`] variant carrying only the
//! parameters that opcode uses, with `Option` presence. The dispatcher
//! mutates planner/heater/fan state and emits exactly one response line
//! per input line: `ok`, an `error: <kind>` line, or (for M114) the
//! position report followed by `ok`.

use core::fmt::{self, Write as _};

use crate::config::DEFAULT_FEEDRATE;
use crate::error::Error;
use crate::hal::Board;
use crate::printer::{Printer, FAN_PART, HEATER_HOTEND};
use crate::toolhead::AxesMask;
use crate::trapq::Coord;

/// Coordinate interpretation for G0/G1 components.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PositioningMode {
    Absolute,
    Relative,
}

/// One parsed command. Each variant enumerates only the parameters its
/// opcode uses; absent parameters stay `None`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Command {
    /// G0/G1
    LinearMove {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        e: Option<f64>,
        f: Option<f64>,
    },
    /// G28; bare axis letters select which axes home.
    Home { x: bool, y: bool, z: bool },
    /// G90
    SetAbsolute,
    /// G91
    SetRelative,
    /// M104
    SetHotendTemp { s: f64 },
    /// M109
    WaitHotendTemp { s: f64 },
    /// M106; S is the raw 0..255 value.
    SetFanSpeed { s: Option<f64> },
    /// M107
    FanOff,
    /// M114
    ReportPosition,
}

impl fmt::Display for Command {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::LinearMove { x, y, z, e, f } => {
                write!(out, "G1")?;
                for (letter, value) in
                    [('X', x), ('Y', y), ('Z', z), ('E', e), ('F', f)]
                {
                    if let Some(v) = value {
                        write!(out, " {}{:.3}", letter, v)?;
                    }
                }
                Ok(())
            }
            Command::Home { x, y, z } => {
                write!(out, "G28")?;
                for (letter, present) in [('X', x), ('Y', y), ('Z', z)] {
                    if *present {
                        write!(out, " {}", letter)?;
                    }
                }
                Ok(())
            }
            Command::SetAbsolute => write!(out, "G90"),
            Command::SetRelative => write!(out, "G91"),
            Command::SetHotendTemp { s } => write!(out, "M104 S{:.3}", s),
            Command::WaitHotendTemp { s } => write!(out, "M109 S{:.3}", s),
            Command::SetFanSpeed { s } => {
                write!(out, "M106")?;
                if let Some(v) = s {
                    write!(out, " S{:.3}", v)?;
                }
                Ok(())
            }
            Command::FanOff => write!(out, "M107"),
            Command::ReportPosition => write!(out, "M114"),
        }
    }
}

/// Parameters accumulated while scanning a line's tokens.
#[derive(Debug, Copy, Clone, Default)]
struct Params {
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    e: Option<f64>,
    f: Option<f64>,
    s: Option<f64>,
    // Bare axis letters (G28 style).
    x_flag: bool,
    y_flag: bool,
    z_flag: bool,
}

/// Parse one input line. `Ok(None)` is a blank or comment line, which
/// still acknowledges with `ok`.
pub fn parse_line(line: &str) -> Result<Option<Command>, Error> {
    let line = match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.is_ascii() {
        return Err(Error::ParseError);
    }

    let mut tokens = line.split_whitespace();
    let opcode = tokens.next().ok_or(Error::ParseError)?;
    let mut chars = opcode.chars();
    let letter = chars.next().ok_or(Error::ParseError)?.to_ascii_uppercase();
    if letter != 'G' && letter != 'M' {
        return Err(Error::BadArgument);
    }
    let code: u16 = chars.as_str().parse().map_err(|_| Error::BadArgument)?;

    let mut params = Params::default();
    for token in tokens {
        let mut tc = token.chars();
        let key = tc.next().ok_or(Error::ParseError)?.to_ascii_uppercase();
        let rest = tc.as_str();
        if rest.is_empty() {
            match key {
                'X' => params.x_flag = true,
                'Y' => params.y_flag = true,
                'Z' => params.z_flag = true,
                _ => return Err(Error::ParseError),
            }
            continue;
        }
        let value: f64 = rest.parse().map_err(|_| Error::ParseError)?;
        match key {
            'X' => {
                params.x = Some(value);
                params.x_flag = true;
            }
            'Y' => {
                params.y = Some(value);
                params.y_flag = true;
            }
            'Z' => {
                params.z = Some(value);
                params.z_flag = true;
            }
            'E' => params.e = Some(value),
            'F' => params.f = Some(value),
            'S' => params.s = Some(value),
            // Unknown parameter letters are tolerated and ignored.
            _ => {}
        }
    }

    let cmd = match (letter, code) {
        ('G', 0) | ('G', 1) => Command::LinearMove {
            x: params.x,
            y: params.y,
            z: params.z,
            e: params.e,
            f: params.f,
        },
        ('G', 28) => Command::Home {
            x: params.x_flag,
            y: params.y_flag,
            z: params.z_flag,
        },
        ('G', 90) => Command::SetAbsolute,
        ('G', 91) => Command::SetRelative,
        ('M', 104) => Command::SetHotendTemp { s: params.s.ok_or(Error::BadArgument)? },
        ('M', 109) => Command::WaitHotendTemp { s: params.s.ok_or(Error::BadArgument)? },
        ('M', 106) => Command::SetFanSpeed { s: params.s },
        ('M', 107) => Command::FanOff,
        ('M', 114) => Command::ReportPosition,
        _ => return Err(Error::UnknownCommand),
    };
    Ok(Some(cmd))
}

/// Dispatcher state carried between lines.
pub struct GcodeState {
    pub mode: PositioningMode,
    /// mm/min, the unit F arrives in.
    pub feedrate: f64,
    /// A pending M109: index of the heater whose target must be reached
    /// before `ok` goes out.
    pub wait_heater: Option<usize>,
}

impl GcodeState {
    pub fn new() -> Self {
        GcodeState {
            mode: PositioningMode::Absolute,
            feedrate: DEFAULT_FEEDRATE,
            wait_heater: None,
        }
    }
}

impl Default for GcodeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the acknowledgement goes out now or once a wait resolves.
enum Ack {
    Now,
    Deferred,
}

/// Parse and execute one line, emitting its response.
pub fn dispatch<B: Board>(printer: &mut Printer<B>, line: &str) {
    match parse_line(line) {
        Ok(None) => printer.respond_ok(),
        Ok(Some(cmd)) => match execute(printer, &cmd) {
            Ok(Ack::Now) => printer.respond_ok(),
            Ok(Ack::Deferred) => {}
            Err(err) => printer.respond_error(err),
        },
        Err(err) => printer.respond_error(err),
    }
}

fn execute<B: Board>(printer: &mut Printer<B>, cmd: &Command) -> Result<Ack, Error> {
    match *cmd {
        Command::LinearMove { x, y, z, e, f } => {
            if let Some(feed) = f {
                if feed <= 0.0 {
                    return Err(Error::BadArgument);
                }
                printer.gcode.feedrate = feed;
            }
            let current = printer.toolhead.get_position();
            let target = match printer.gcode.mode {
                PositioningMode::Absolute => Coord::new(
                    x.unwrap_or(current.x),
                    y.unwrap_or(current.y),
                    z.unwrap_or(current.z),
                    e.unwrap_or(current.e),
                ),
                PositioningMode::Relative => Coord::new(
                    current.x + x.unwrap_or(0.0),
                    current.y + y.unwrap_or(0.0),
                    current.z + z.unwrap_or(0.0),
                    current.e + e.unwrap_or(0.0),
                ),
            };
            let speed = printer.gcode.feedrate / 60.0;
            let now = printer.board.now_us();
            printer.toolhead.align_print_time(now);
            printer.toolhead.move_to(target, speed)?;
            printer.service_motion();
            Ok(Ack::Now)
        }
        Command::Home { x, y, z } => {
            let mut axes = AxesMask::empty();
            if x {
                axes |= AxesMask::X;
            }
            if y {
                axes |= AxesMask::Y;
            }
            if z {
                axes |= AxesMask::Z;
            }
            if axes.is_empty() {
                axes = AxesMask::X | AxesMask::Y | AxesMask::Z;
            }
            printer.home(axes)?;
            Ok(Ack::Now)
        }
        Command::SetAbsolute => {
            printer.gcode.mode = PositioningMode::Absolute;
            Ok(Ack::Now)
        }
        Command::SetRelative => {
            printer.gcode.mode = PositioningMode::Relative;
            Ok(Ack::Now)
        }
        Command::SetHotendTemp { s } => {
            printer.set_heater_target(HEATER_HOTEND, s as f32);
            Ok(Ack::Now)
        }
        Command::WaitHotendTemp { s } => {
            printer.set_heater_target(HEATER_HOTEND, s as f32);
            printer.gcode.wait_heater = Some(HEATER_HOTEND);
            Ok(Ack::Deferred)
        }
        Command::SetFanSpeed { s } => {
            let raw = s.unwrap_or(255.0);
            let speed = (raw / 255.0).clamp(0.0, 1.0) as f32;
            printer.set_fan_speed(FAN_PART, speed);
            Ok(Ack::Now)
        }
        Command::FanOff => {
            printer.set_fan_speed(FAN_PART, 0.0);
            Ok(Ack::Now)
        }
        Command::ReportPosition => {
            let pos = printer.toolhead.get_position();
            let mut line: heapless::String<64> = heapless::String::new();
            let _ = write!(
                line,
                "X:{:.2} Y:{:.2} Z:{:.2} E:{:.2}\r\n",
                pos.x, pos.y, pos.z, pos.e
            );
            printer.respond_raw(line.as_str());
            Ok(Ack::Now)
        }
    }
}
