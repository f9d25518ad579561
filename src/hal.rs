//! Hardware abstraction boundary. Board bring-up lives outside this crate;
//! everything the core needs from the silicon comes through [`Board`].

/// MCU pin identifier; banks of 16, see [`crate::config::gpio`].
pub type PinId = u8;

/// ADC read failure modes surfaced by a board port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdcError {
    /// The channel is not wired or cannot be sampled.
    InvalidChannel,
    /// The conversion did not complete within its microsecond budget.
    Timeout,
    /// The converter reported a hardware fault.
    ReadFault,
}

/// Services a board port must provide to the firmware core.
///
/// The contract mirrors the cooperative scheduling model: every method is
/// called from the main loop only, never from an interrupt. The serial RX
/// path (the one true ISR producer) enters the core through
/// [`crate::printer::Printer::rx_bytes`] instead.
pub trait Board {
    /// Monotonic microsecond clock, wrapping at 2^32. Ports combine a
    /// hardware timer with a 32-bit millisecond tick so sub-millisecond
    /// resolution is preserved. All consumers compare times with the
    /// signed wrap-aware difference; durations must stay below 2^31 µs.
    fn now_us(&self) -> u32;

    /// Drive an output pin. Called for step, dir, enable, heater and fan
    /// pins; must be glitch-free at step rates.
    fn gpio_out_write(&mut self, pin: PinId, high: bool);

    /// Sample an input pin (endstops).
    fn gpio_in_read(&self, pin: PinId) -> bool;

    /// Single-shot, polled ADC conversion on the given channel (12-bit).
    fn adc_read(&mut self, channel: u8) -> Result<u16, AdcError>;

    /// Push response bytes toward the serial TX path.
    fn serial_write(&mut self, data: &[u8]);

    /// Short busy delay, used only for the step pulse width.
    fn delay_us(&mut self, us: u32);

    /// Park until the clock reaches `wake`. A hardware port may simply
    /// spin or `wfi`; the simulated board advances its clock.
    fn idle_until(&mut self, wake: u32) {
        while crate::sched::timer_is_before(self.now_us(), wake) {}
    }
}
