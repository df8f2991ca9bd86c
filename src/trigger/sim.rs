//! Simulated board parts.
//!
//! Used by the unit tests and by `camsync simulate`, which runs the controller
//! over stdin/stdout so the host link can be exercised without hardware. Every
//! part is a cheap handle around shared state: clone it before handing it to
//! the controller and keep the clone to drive or inspect it.

use super::hal::{Clock, InputPin, SerialIo, StatusLed, TriggerLines};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Manually advanced clock.
#[derive(Debug, Clone, Default)]
pub struct SimClock(Arc<AtomicU32>);

impl SimClock {
    /// Clock reading `start_micros` until advanced.
    pub fn new(start_micros: u32) -> Self {
        Self(Arc::new(AtomicU32::new(start_micros)))
    }

    /// Move time forward, wrapping like the hardware counter.
    pub fn advance(&self, micros: u32) {
        self.0.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_micros(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall clock for running the controller on the host.
#[derive(Debug, Clone)]
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    /// Clock whose zero is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_micros(&self) -> u32 {
        // Truncation reproduces the 32-bit counter rollover.
        self.origin.elapsed().as_micros() as u32
    }
}

/// One recorded output pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    /// Lines driven, bit 0 is camera 1.
    pub mask: u8,
    /// How long the lines were held high.
    pub width_us: u32,
}

/// Trigger outputs that record every pulse instead of toggling pins.
#[derive(Debug, Clone, Default)]
pub struct SimLines(Arc<Mutex<Vec<Pulse>>>);

impl SimLines {
    /// No pulses recorded yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pulse so far, oldest first.
    pub fn pulses(&self) -> Vec<Pulse> {
        self.0.lock().clone()
    }

    /// Number of pulses so far.
    pub fn count(&self) -> usize {
        self.0.lock().len()
    }
}

impl TriggerLines for SimLines {
    fn pulse(&mut self, mask: u8, width_us: u32) {
        self.0.lock().push(Pulse { mask, width_us });
    }
}

/// Trigger outputs for the host simulator: pulses are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggedLines;

impl TriggerLines for LoggedLines {
    fn pulse(&mut self, mask: u8, width_us: u32) {
        trace!(mask = format_args!("{mask:#06b}"), width_us, "Trigger pulse");
    }
}

/// Input whose level is set by the test.
#[derive(Debug, Clone, Default)]
pub struct SimPin(Arc<AtomicBool>);

impl SimPin {
    /// Released pin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive the input level seen by the controller.
    pub fn set(&self, asserted: bool) {
        self.0.store(asserted, Ordering::SeqCst);
    }
}

impl InputPin for SimPin {
    fn is_asserted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Status LED that remembers its level and how often it was switched.
#[derive(Debug, Clone, Default)]
pub struct SimLed {
    on: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl SimLed {
    /// LED that starts off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Level last written by the controller.
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Number of level changes written.
    pub fn changes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl StatusLed for SimLed {
    fn set(&mut self, on: bool) {
        if self.on.swap(on, Ordering::SeqCst) != on {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// In-memory serial port.
#[derive(Debug, Default)]
pub struct SimSerial {
    input: VecDeque<u8>,
    output: Vec<String>,
}

impl SimSerial {
    /// Port with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw bytes as if the host had sent them.
    pub fn feed(&mut self, data: &str) {
        self.input.extend(data.bytes());
    }

    /// Lines written by the device since the last call.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }
}

impl SerialIo for SimSerial {
    fn read_byte(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn write_line(&mut self, line: &str) {
        self.output.push(line.to_string());
    }
}

/// Serial port backed by the process's stdin and stdout.
///
/// stdin is drained by a helper thread so `read_byte` never blocks the
/// controller loop.
pub struct StdioSerial {
    rx: mpsc::Receiver<u8>,
    closed: bool,
}

impl StdioSerial {
    /// Start draining stdin on a background thread.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            let mut lock = stdin.lock();
            let mut line = Vec::new();
            loop {
                line.clear();
                match lock.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        for &b in &line {
                            if tx.send(b).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        Self { rx, closed: false }
    }

    /// `true` once stdin reached end of file and every byte was consumed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl SerialIo for StdioSerial {
    fn read_byte(&mut self) -> Option<u8> {
        match self.rx.try_recv() {
            Ok(b) => Some(b),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.closed = true;
                None
            }
        }
    }

    fn write_line(&mut self, line: &str) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        // A closed stdout leaves nobody to report to.
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}
