//! Trigger device state machine.
//!
//! [`TriggerController`] is the firmware's main loop body. The board calls
//! [`TriggerController::poll`] as fast as it can; each call performs one
//! scheduling tick in a fixed order:
//!
//! 1. resolve a pending kill (`Stopping -> Idle`, `STOPPED:<n>`)
//! 2. buttons: kill switch first, then the start button
//! 3. serial: at most one complete command line
//! 4. timing: fire all active lines once the frame interval elapsed
//! 5. status LED
//!
//! Nothing in a tick blocks except the trigger pulse itself, which is held for
//! the configured pulse width.
//!
//! Both buttons share one debounce interval. A first assertion after a quiet
//! period is acted on in the same tick; only changes that follow an accepted
//! change within the interval are held back. The kill switch is level
//! triggered and acts whenever its debounced level is high while recording,
//! the start button acts on a debounced rising edge while armed.
//!
//! The frame timer re-anchors on the sample that fired, not on
//! `anchor + interval`. Lateness in one tick shifts every following frame by
//! the same amount instead of being caught up.

use super::hal::{Clock, InputPin, SerialIo, StatusLed, TriggerLines};
use super::protocol::{
    camera_mask, interval_micros, Command, DeviceMessage, TriggerState, TriggerStatus,
    DEFAULT_CAMERAS, DEFAULT_FPS,
};

/// Receive buffer size. Longer lines are rejected.
pub const LINE_CAPACITY: usize = 64;

/// Microseconds from `anchor` to `now` on a wrapping 32-bit counter.
pub fn elapsed_micros(now: u32, anchor: u32) -> u32 {
    if now >= anchor {
        now - anchor
    } else {
        (u32::MAX - anchor) + now + 1
    }
}

/// Board-level tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// How long trigger lines are held high.
    pub pulse_width_us: u32,
    /// Minimum time between accepted level changes of either button.
    pub debounce_us: u32,
    /// Emit `FRAME:<n>` every this many frames. 0 disables.
    pub frame_report_interval: u32,
    /// Trigger rate at boot.
    pub fps: u32,
    /// Active trigger lines at boot.
    pub cameras: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pulse_width_us: 100,
            debounce_us: 50_000,
            frame_report_interval: 0,
            fps: DEFAULT_FPS,
            cameras: DEFAULT_CAMERAS,
        }
    }
}

/// Software debounce: a level change is accepted only once `interval` has
/// passed since the previous accepted change. The first change is immediate.
#[derive(Debug, Default)]
struct Debounce {
    stable: bool,
    last_change: Option<u32>,
}

impl Debounce {
    /// Feed a raw sample, returns the debounced level.
    fn level(&mut self, raw: bool, now: u32, interval: u32) -> bool {
        if raw != self.stable {
            let settled = self
                .last_change
                .map_or(true, |last| elapsed_micros(now, last) >= interval);
            if settled {
                self.stable = raw;
                self.last_change = Some(now);
            }
        }
        self.stable
    }

    /// Feed a raw sample, returns `true` on an accepted rising edge.
    fn rising_edge(&mut self, raw: bool, now: u32, interval: u32) -> bool {
        let was = self.stable;
        self.level(raw, now, interval) && !was
    }
}

/// Device-side controller. Owns every piece of mutable device state.
pub struct TriggerController<C, L, B, K, D> {
    config: ControllerConfig,
    clock: C,
    lines: L,
    start_button: B,
    kill_switch: K,
    led: D,

    state: TriggerState,
    frame_count: u32,
    fps: u32,
    interval_us: u32,
    cameras: u8,
    mask: u8,
    anchor: u32,

    start_debounce: Debounce,
    kill_debounce: Debounce,
    led_on: bool,
    led_written: Option<bool>,

    rx: [u8; LINE_CAPACITY],
    rx_len: usize,
    rx_overflow: bool,
}

impl<C, L, B, K, D> TriggerController<C, L, B, K, D>
where
    C: Clock,
    L: TriggerLines,
    B: InputPin,
    K: InputPin,
    D: StatusLed,
{
    /// Controller in `Idle` with the boot rate and line count from `config`.
    pub fn new(
        config: ControllerConfig,
        clock: C,
        lines: L,
        start_button: B,
        kill_switch: K,
        led: D,
    ) -> Self {
        let fps = config.fps;
        let cameras = config.cameras;
        let anchor = clock.now_micros();
        Self {
            config,
            clock,
            lines,
            start_button,
            kill_switch,
            led,
            state: TriggerState::Idle,
            frame_count: 0,
            fps,
            interval_us: interval_micros(fps),
            cameras,
            mask: camera_mask(cameras),
            anchor,
            start_debounce: Debounce::default(),
            kill_debounce: Debounce::default(),
            led_on: false,
            led_written: None,
            rx: [0; LINE_CAPACITY],
            rx_len: 0,
            rx_overflow: false,
        }
    }

    /// Announce the device once after power-up.
    pub fn boot(&mut self, io: &mut impl SerialIo) {
        self.update_led();
        emit(io, DeviceMessage::Ready);
    }

    /// Run one scheduling tick.
    pub fn poll(&mut self, io: &mut impl SerialIo) {
        if self.state == TriggerState::Stopping {
            self.state = TriggerState::Idle;
            emit(io, DeviceMessage::Stopped(self.frame_count));
        }

        self.check_buttons(io);
        self.read_serial(io);
        self.check_timing(io);
        self.update_led();
    }

    /// Current operating state.
    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Pulses fired since recording last started.
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Current frame interval.
    pub fn interval_micros(&self) -> u32 {
        self.interval_us
    }

    /// Lines pulsed on each frame.
    pub fn active_mask(&self) -> u8 {
        self.mask
    }

    /// Snapshot as reported by `STATUS`.
    pub fn status(&self) -> TriggerStatus {
        TriggerStatus {
            state: self.state,
            frame_count: self.frame_count,
            fps: self.fps,
            active_cameras: self.cameras,
        }
    }

    fn check_buttons(&mut self, io: &mut impl SerialIo) {
        let now = self.clock.now_micros();
        // Sampled every tick so the debounced level tracks the pin in any state.
        let killed = self
            .kill_debounce
            .level(self.kill_switch.is_asserted(), now, self.config.debounce_us);
        if killed && self.state == TriggerState::Recording {
            self.state = TriggerState::Stopping;
            emit(io, DeviceMessage::Killed);
            return;
        }

        let pressed = self.start_button.is_asserted();
        if self
            .start_debounce
            .rising_edge(pressed, now, self.config.debounce_us)
            && self.state == TriggerState::Armed
        {
            emit(io, DeviceMessage::Button("START".into()));
            self.begin_recording(io);
        }
    }

    fn read_serial(&mut self, io: &mut impl SerialIo) {
        while let Some(byte) = io.read_byte() {
            match byte {
                b'\n' => {
                    let len = std::mem::take(&mut self.rx_len);
                    if std::mem::take(&mut self.rx_overflow) {
                        emit(io, DeviceMessage::Error("Line too long".into()));
                        return;
                    }
                    let line = String::from_utf8_lossy(&self.rx[..len]).into_owned();
                    self.handle_line(&line, io);
                    return;
                }
                b'\r' => {}
                _ if self.rx_len < LINE_CAPACITY => {
                    self.rx[self.rx_len] = byte;
                    self.rx_len += 1;
                }
                _ => self.rx_overflow = true,
            }
        }
    }

    fn handle_line(&mut self, line: &str, io: &mut impl SerialIo) {
        if line.trim().is_empty() {
            return;
        }
        match Command::parse(line) {
            Ok(command) => self.execute(command, io),
            Err(e) => emit(io, DeviceMessage::Error(e.to_string())),
        }
    }

    fn execute(&mut self, command: Command, io: &mut impl SerialIo) {
        match command {
            Command::Arm => {
                if self.state == TriggerState::Idle {
                    self.state = TriggerState::Armed;
                    emit(io, DeviceMessage::Armed);
                } else {
                    emit(io, DeviceMessage::Error(format!("Cannot arm from {}", self.state)));
                }
            }
            Command::Disarm => {
                if self.state == TriggerState::Armed {
                    self.state = TriggerState::Idle;
                    emit(io, DeviceMessage::Disarmed);
                } else {
                    emit(io, DeviceMessage::Error("Not armed".into()));
                }
            }
            Command::Start => match self.state {
                TriggerState::Idle | TriggerState::Armed => self.begin_recording(io),
                TriggerState::Recording | TriggerState::Stopping => {
                    emit(io, DeviceMessage::Error("Already recording".into()));
                }
            },
            Command::Stop => {
                if self.state == TriggerState::Recording {
                    self.state = TriggerState::Idle;
                    emit(io, DeviceMessage::Stopped(self.frame_count));
                } else {
                    emit(io, DeviceMessage::Error("Not recording".into()));
                }
            }
            Command::Trigger => {
                self.fire();
                emit(io, DeviceMessage::Triggered(self.frame_count));
            }
            Command::SetFps(fps) => {
                self.fps = fps;
                self.interval_us = interval_micros(fps);
                emit(io, DeviceMessage::FpsSet(fps));
            }
            Command::SetCameras(n) => {
                self.cameras = n;
                self.mask = camera_mask(n);
                emit(io, DeviceMessage::CamerasSet(n));
            }
            Command::Status => emit(io, DeviceMessage::Status(self.status())),
            Command::Ping => emit(io, DeviceMessage::Pong),
        }
    }

    fn begin_recording(&mut self, io: &mut impl SerialIo) {
        self.state = TriggerState::Recording;
        self.frame_count = 0;
        self.anchor = self.clock.now_micros();
        self.led_on = true;
        emit(io, DeviceMessage::Recording);
    }

    fn check_timing(&mut self, io: &mut impl SerialIo) {
        if self.state != TriggerState::Recording {
            return;
        }
        let now = self.clock.now_micros();
        if elapsed_micros(now, self.anchor) < self.interval_us {
            return;
        }
        self.anchor = now;
        self.fire();
        self.led_on = !self.led_on;

        let every = self.config.frame_report_interval;
        if every > 0 && self.frame_count % every == 0 {
            emit(io, DeviceMessage::Frame(self.frame_count));
        }
    }

    fn fire(&mut self) {
        self.lines.pulse(self.mask, self.config.pulse_width_us);
        self.frame_count = self.frame_count.wrapping_add(1);
    }

    fn update_led(&mut self) {
        let on = match self.state {
            TriggerState::Idle | TriggerState::Stopping => false,
            TriggerState::Armed => true,
            TriggerState::Recording => self.led_on,
        };
        if self.led_written != Some(on) {
            self.led.set(on);
            self.led_written = Some(on);
        }
    }
}

fn emit(io: &mut impl SerialIo, message: DeviceMessage) {
    io.write_line(&message.to_string());
}
