use thiserror::Error;

/// Firmware-level error taxonomy. Every fallible operation returns one of
/// these by value; there is no unwinding and no asynchronous propagation.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Out-of-range or missing parameter to a public operation.
    #[error("invalid argument")]
    BadArgument,
    /// Opcode not in the supported command table.
    #[error("unknown command")]
    UnknownCommand,
    /// Requested motion endpoint violates the soft limits.
    #[error("move out of bounds")]
    OutOfBounds,
    /// Lookahead ring or step queue saturated and a flush could not free space.
    #[error("motion queue full")]
    QueueFull,
    /// Homing timeout expired without an endstop assertion.
    #[error("homing failed")]
    HomingFailed,
    /// ADC read returned an error sentinel.
    #[error("sensor reading invalid")]
    SensorInvalid,
    /// A fixed-size pool had no free slot; cannot occur in a correctly
    /// sized build.
    #[error("pool exhausted")]
    PoolExhausted,
    /// Input line was not parseable as a command.
    #[error("parse error")]
    ParseError,
}

impl Error {
    /// Response line category for a failed command, per the serial protocol.
    pub fn response_kind(&self) -> &'static str {
        match self {
            Error::BadArgument => "invalid command",
            Error::UnknownCommand => "unknown command",
            Error::ParseError => "parse error",
            _ => "execution failed",
        }
    }
}
