//! Hardware seams for the trigger controller.
//!
//! The controller only touches the board through these traits. A firmware
//! build implements them over GPIO registers and the UART; the host build uses
//! the simulated parts in [`super::sim`].

/// Free-running microsecond counter. Wraps at `u32::MAX`.
pub trait Clock {
    /// Current counter value.
    fn now_micros(&self) -> u32;
}

/// Trigger outputs, one bit per camera line.
pub trait TriggerLines {
    /// Drive every line in `mask` high in a single write, hold for
    /// `width_us`, then drive them low again.
    fn pulse(&mut self, mask: u8, width_us: u32);
}

/// Digital input (button or switch). `true` means pressed / engaged.
pub trait InputPin {
    /// Sample the input level.
    fn is_asserted(&self) -> bool;
}

/// Front-panel status indicator.
pub trait StatusLed {
    /// Switch the indicator on or off.
    fn set(&mut self, on: bool);
}

/// Byte-oriented serial port as seen from the device.
pub trait SerialIo {
    /// Next received byte, `None` when nothing is waiting. Must not block.
    fn read_byte(&mut self) -> Option<u8>;

    /// Send one line; the implementation appends the terminator.
    fn write_line(&mut self, line: &str);
}
