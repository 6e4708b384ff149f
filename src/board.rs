use std::collections::VecDeque;
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;

use crate::error::ColorimeterError;
use crate::series::Channel;

const FIRMATA_BAUD: u32 = 57_600;
const SERIAL_TIMEOUT: Duration = Duration::from_millis(50);
const ANALOG_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// The board reboots when the serial port opens; give it time to come back.
const BOARD_RESET_DELAY: Duration = Duration::from_secs(1);
const PIN_SETUP_DELAY: Duration = Duration::from_millis(100);

const DIGITAL_MESSAGE: u8 = 0x90;
const ANALOG_MESSAGE: u8 = 0xE0;
const REPORT_ANALOG: u8 = 0xC0;
const SET_PIN_MODE: u8 = 0xF4;
const REPORT_VERSION: u8 = 0xF9;
const START_SYSEX: u8 = 0xF0;
const END_SYSEX: u8 = 0xF7;

const MODE_OUTPUT: u8 = 0x01;
const MODE_PWM: u8 = 0x03;

const ANALOG_MAX: f64 = 1023.0;

/// Minimal capability surface the acquisition loop needs from the hardware:
/// three LED outputs, one PWM buzzer, three normalized analog inputs, and an
/// explicit release.
pub trait Board {
    fn set_led(&mut self, channel: Channel, on: bool) -> Result<(), ColorimeterError>;
    /// Buzzer duty cycle, 0.0 (silent) to 1.0.
    fn set_buzzer(&mut self, duty: f64) -> Result<(), ColorimeterError>;
    fn read_photodetector(&mut self) -> Result<f64, ColorimeterError>;
    fn read_thermistor(&mut self) -> Result<f64, ColorimeterError>;
    fn read_pause_sensor(&mut self) -> Result<f64, ColorimeterError>;
    fn close(&mut self) -> Result<(), ColorimeterError>;
}

impl<B: Board + ?Sized> Board for &mut B {
    fn set_led(&mut self, channel: Channel, on: bool) -> Result<(), ColorimeterError> {
        (**self).set_led(channel, on)
    }
    fn set_buzzer(&mut self, duty: f64) -> Result<(), ColorimeterError> {
        (**self).set_buzzer(duty)
    }
    fn read_photodetector(&mut self) -> Result<f64, ColorimeterError> {
        (**self).read_photodetector()
    }
    fn read_thermistor(&mut self) -> Result<f64, ColorimeterError> {
        (**self).read_thermistor()
    }
    fn read_pause_sensor(&mut self) -> Result<f64, ColorimeterError> {
        (**self).read_pause_sensor()
    }
    fn close(&mut self) -> Result<(), ColorimeterError> {
        (**self).close()
    }
}

impl<B: Board + ?Sized> Board for Box<B> {
    fn set_led(&mut self, channel: Channel, on: bool) -> Result<(), ColorimeterError> {
        (**self).set_led(channel, on)
    }
    fn set_buzzer(&mut self, duty: f64) -> Result<(), ColorimeterError> {
        (**self).set_buzzer(duty)
    }
    fn read_photodetector(&mut self) -> Result<f64, ColorimeterError> {
        (**self).read_photodetector()
    }
    fn read_thermistor(&mut self) -> Result<f64, ColorimeterError> {
        (**self).read_thermistor()
    }
    fn read_pause_sensor(&mut self) -> Result<f64, ColorimeterError> {
        (**self).read_pause_sensor()
    }
    fn close(&mut self) -> Result<(), ColorimeterError> {
        (**self).close()
    }
}

/// Where each role is wired on the board. Defaults match the instrument as
/// built: D9 blue, D8 green, D10 red, D6 buzzer (PWM), A0 photodetector,
/// A1 thermistor, A2 pause sensor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PinMapping {
    pub blue_led: u8,
    pub green_led: u8,
    pub red_led: u8,
    pub buzzer: u8,
    pub photodetector: u8,
    pub thermistor: u8,
    pub pause_sensor: u8,
}

impl Default for PinMapping {
    fn default() -> Self {
        Self {
            blue_led: 9,
            green_led: 8,
            red_led: 10,
            buzzer: 6,
            photodetector: 0,
            thermistor: 1,
            pause_sensor: 2,
        }
    }
}

impl PinMapping {
    pub fn led_pin(&self, channel: Channel) -> u8 {
        match channel {
            Channel::Blue => self.blue_led,
            Channel::Green => self.green_led,
            Channel::Red => self.red_led,
        }
    }
}

fn set_pin_mode_message(pin: u8, mode: u8) -> [u8; 3] {
    [SET_PIN_MODE, pin & 0x7F, mode]
}

fn digital_message(port: u8, state: u8) -> [u8; 3] {
    [DIGITAL_MESSAGE | (port & 0x0F), state & 0x7F, (state >> 7) & 0x7F]
}

fn analog_write_message(pin: u8, level: u8) -> [u8; 3] {
    [
        ANALOG_MESSAGE | (pin & 0x0F),
        level & 0x7F,
        (level as u16 >> 7) as u8 & 0x7F,
    ]
}

fn report_analog_message(channel: u8, enabled: bool) -> [u8; 2] {
    [REPORT_ANALOG | (channel & 0x0F), u8::from(enabled)]
}

/// Incremental parser for the inbound Firmata stream. Only analog reports are
/// surfaced; version reports, digital reports and sysex payloads are skipped.
#[derive(Debug, Default)]
struct AnalogParser {
    state: ParserState,
}

#[derive(Debug, Default)]
enum ParserState {
    #[default]
    Idle,
    InSysex,
    Collecting {
        analog_channel: Option<u8>,
        lsb: Option<u8>,
    },
}

#[derive(Debug, PartialEq, Eq)]
struct AnalogReading {
    channel: u8,
    value: u16,
}

impl AnalogParser {
    fn feed(&mut self, byte: u8) -> Option<AnalogReading> {
        match &mut self.state {
            ParserState::Idle => {
                if byte == START_SYSEX {
                    self.state = ParserState::InSysex;
                } else if byte & 0x80 != 0 {
                    let command = byte & 0xF0;
                    if command == ANALOG_MESSAGE {
                        self.state = ParserState::Collecting {
                            analog_channel: Some(byte & 0x0F),
                            lsb: None,
                        };
                    } else if command == DIGITAL_MESSAGE || byte == REPORT_VERSION {
                        self.state = ParserState::Collecting {
                            analog_channel: None,
                            lsb: None,
                        };
                    }
                    // anything else with the high bit set is ignored
                }
                None
            }
            ParserState::InSysex => {
                if byte == END_SYSEX {
                    self.state = ParserState::Idle;
                }
                None
            }
            ParserState::Collecting { analog_channel, lsb } => {
                if byte & 0x80 != 0 {
                    // a fresh command interrupts the pending one
                    self.state = ParserState::Idle;
                    return self.feed(byte);
                }
                match lsb.take() {
                    None => {
                        *lsb = Some(byte);
                        None
                    }
                    Some(low) => {
                        let reading = analog_channel.map(|channel| AnalogReading {
                            channel,
                            value: u16::from(low) | (u16::from(byte) << 7),
                        });
                        self.state = ParserState::Idle;
                        reading
                    }
                }
            }
        }
    }
}

/// Firmata client for the colorimeter board, one serial connection per run.
///
/// The session owns the port for its whole lifetime and forces all outputs
/// low again on release so the instrument is never left with an LED energized.
pub struct FirmataBoard {
    port: Box<dyn SerialPort>,
    pins: PinMapping,
    port_state: [u8; 8],
    analog: [Option<f64>; 16],
    parser: AnalogParser,
    closed: bool,
}

impl FirmataBoard {
    pub fn open(path: &str, pins: PinMapping) -> Result<Self, ColorimeterError> {
        let port = serialport::new(path, FIRMATA_BAUD)
            .timeout(SERIAL_TIMEOUT)
            .open()?;
        let mut board = Self {
            port,
            pins,
            port_state: [0; 8],
            analog: [None; 16],
            parser: AnalogParser::default(),
            closed: false,
        };
        thread::sleep(BOARD_RESET_DELAY);
        board.pump()?;

        for channel in Channel::ALL {
            let pin = board.pins.led_pin(channel);
            board.send(&set_pin_mode_message(pin, MODE_OUTPUT))?;
            board.digital_write(pin, false)?;
            thread::sleep(PIN_SETUP_DELAY);
        }
        board.send(&set_pin_mode_message(board.pins.buzzer, MODE_PWM))?;
        board.pwm_write(board.pins.buzzer, 0.0)?;
        thread::sleep(PIN_SETUP_DELAY);

        for analog_channel in [
            board.pins.photodetector,
            board.pins.thermistor,
            board.pins.pause_sensor,
        ] {
            board.send(&report_analog_message(analog_channel, true))?;
        }
        thread::sleep(PIN_SETUP_DELAY);
        Ok(board)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ColorimeterError> {
        use std::io::Write;
        self.port
            .write_all(bytes)
            .map_err(|e| ColorimeterError::HardwareIo(format!("serial write: {e}")))
    }

    fn digital_write(&mut self, pin: u8, high: bool) -> Result<(), ColorimeterError> {
        let port = usize::from(pin / 8);
        let bit = 1u8 << (pin % 8);
        if high {
            self.port_state[port] |= bit;
        } else {
            self.port_state[port] &= !bit;
        }
        let state = self.port_state[port];
        self.send(&digital_message(port as u8, state))
    }

    fn pwm_write(&mut self, pin: u8, duty: f64) -> Result<(), ColorimeterError> {
        let level = (duty.clamp(0.0, 1.0) * 255.0).round() as u8;
        self.send(&analog_write_message(pin, level))
    }

    /// Drains whatever the board has sent and refreshes the analog cache.
    fn pump(&mut self) -> Result<(), ColorimeterError> {
        let mut buf = [0u8; 256];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    for &byte in &buf[..n] {
                        if let Some(reading) = self.parser.feed(byte) {
                            if let Some(slot) = self.analog.get_mut(usize::from(reading.channel)) {
                                *slot = Some(f64::from(reading.value) / ANALOG_MAX);
                            }
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(()),
                Err(e) => return Err(ColorimeterError::HardwareIo(format!("serial read: {e}"))),
            }
        }
    }

    fn read_analog(&mut self, channel: u8) -> Result<f64, ColorimeterError> {
        let deadline = Instant::now() + ANALOG_READ_TIMEOUT;
        loop {
            self.pump()?;
            if let Some(value) = self.analog.get(usize::from(channel)).copied().flatten() {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(ColorimeterError::HardwareIo(format!(
                    "no analog data on channel A{channel}"
                )));
            }
        }
    }
}

impl Board for FirmataBoard {
    fn set_led(&mut self, channel: Channel, on: bool) -> Result<(), ColorimeterError> {
        let pin = self.pins.led_pin(channel);
        self.digital_write(pin, on)
    }

    fn set_buzzer(&mut self, duty: f64) -> Result<(), ColorimeterError> {
        let pin = self.pins.buzzer;
        self.pwm_write(pin, duty)
    }

    fn read_photodetector(&mut self) -> Result<f64, ColorimeterError> {
        let channel = self.pins.photodetector;
        self.read_analog(channel)
    }

    fn read_thermistor(&mut self) -> Result<f64, ColorimeterError> {
        let channel = self.pins.thermistor;
        self.read_analog(channel)
    }

    fn read_pause_sensor(&mut self) -> Result<f64, ColorimeterError> {
        let channel = self.pins.pause_sensor;
        self.read_analog(channel)
    }

    fn close(&mut self) -> Result<(), ColorimeterError> {
        if !self.closed {
            for channel in Channel::ALL {
                let pin = self.pins.led_pin(channel);
                self.digital_write(pin, false)?;
            }
            let buzzer = self.pins.buzzer;
            self.pwm_write(buzzer, 0.0)?;
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for FirmataBoard {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Deterministic in-memory board for tests and `--simulate` dry runs.
///
/// The photodetector reads back the level of whichever LED is currently lit
/// (a dark level otherwise), so a run against it also verifies the loop's LED
/// sequencing. Pause-sensor readings can be scripted, buzzer writes are
/// recorded, and a board fault can be injected after a set number of LED
/// activations.
pub struct SimulatedBoard {
    photo_levels: [f64; 3],
    dark_level: f64,
    thermistor_level: f64,
    pause_script: VecDeque<f64>,
    pause_idle: f64,
    noise: f64,
    lit: Option<Channel>,
    buzzer_writes: Vec<f64>,
    led_activations: usize,
    fail_after_led_activations: Option<usize>,
    closed: bool,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self {
            photo_levels: [0.62, 0.54, 0.47],
            dark_level: 0.02,
            thermistor_level: 0.044,
            pause_script: VecDeque::new(),
            pause_idle: 0.0,
            noise: 0.0,
            lit: None,
            buzzer_writes: Vec::new(),
            led_activations: 0,
            fail_after_led_activations: None,
            closed: false,
        }
    }
}

impl SimulatedBoard {
    pub fn with_photo_levels(mut self, levels: [f64; 3]) -> Self {
        self.photo_levels = levels;
        self
    }

    pub fn with_thermistor_level(mut self, level: f64) -> Self {
        self.thermistor_level = level;
        self
    }

    /// Pause-sensor readings returned in order; after the script runs out the
    /// idle level (default 0.0) is reported.
    pub fn with_pause_script(mut self, readings: impl IntoIterator<Item = f64>) -> Self {
        self.pause_script = readings.into_iter().collect();
        self
    }

    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    /// Injects a hardware fault on LED activation `n + 1`.
    pub fn failing_after_led_activations(mut self, n: usize) -> Self {
        self.fail_after_led_activations = Some(n);
        self
    }

    pub fn buzzer_writes(&self) -> &[f64] {
        &self.buzzer_writes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn jitter(&self, value: f64) -> f64 {
        if self.noise > 0.0 {
            value + rand::thread_rng().gen_range(-self.noise..self.noise)
        } else {
            value
        }
    }
}

impl Board for SimulatedBoard {
    fn set_led(&mut self, channel: Channel, on: bool) -> Result<(), ColorimeterError> {
        if on {
            self.led_activations += 1;
            if let Some(limit) = self.fail_after_led_activations {
                if self.led_activations > limit {
                    return Err(ColorimeterError::HardwareIo(
                        "injected board fault".to_string(),
                    ));
                }
            }
            self.lit = Some(channel);
        } else if self.lit == Some(channel) {
            self.lit = None;
        }
        Ok(())
    }

    fn set_buzzer(&mut self, duty: f64) -> Result<(), ColorimeterError> {
        self.buzzer_writes.push(duty);
        Ok(())
    }

    fn read_photodetector(&mut self) -> Result<f64, ColorimeterError> {
        let base = match self.lit {
            Some(channel) => self.photo_levels[channel.index()],
            None => self.dark_level,
        };
        Ok(self.jitter(base))
    }

    fn read_thermistor(&mut self) -> Result<f64, ColorimeterError> {
        Ok(self.jitter(self.thermistor_level))
    }

    fn read_pause_sensor(&mut self) -> Result<f64, ColorimeterError> {
        Ok(self.pause_script.pop_front().unwrap_or(self.pause_idle))
    }

    fn close(&mut self) -> Result<(), ColorimeterError> {
        self.lit = None;
        self.closed = true;
        Ok(())
    }
}
