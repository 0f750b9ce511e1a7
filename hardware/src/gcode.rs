//! Smoothieware G-code driver.
//!
//! Commands are newline-terminated ASCII; every command is acknowledged with a
//! line starting with `ok`. Motion commands are followed by `M400` so a move
//! returns only once the controller reports the motion queue empty.
//!
//! | Operation        | G-code            |
//! |------------------|-------------------|
//! | Home             | `G28.2 XYZ`       |
//! | Absolute move    | `G0 F<mm/min> X..`|
//! | Wait for motion  | `M400`            |
//! | Machine position | `M114.2`          |
//! | Probe            | `G38.2 Z-<dist>`  |
//! | Motor currents   | `M907 X1.25`      |
//! | Emergency stop   | `M112`            |
//! | Clear alarm      | `M999`            |

use std::collections::BTreeSet;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::axis::{Axis, AxisMap};
use crate::driver::{DriverControl, MotorDriver};
use crate::errors::{DriverError, DriverResult};

/// Default serial baud rate for the motion controller.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial read timeout; long enough to cover a full-travel move plus `M400`.
const SERIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default feed rate in mm/s when the caller does not specify one.
const DEFAULT_SPEED_MM_S: f64 = 400.0;

/// Feed rate used while probing, mm/s.
const PROBE_SPEED_MM_S: f64 = 5.0;

/// G-code motion controller driver over any byte transport.
pub struct GcodeDriver<T: Read + Write> {
    port: T,
    control: DriverControl,
    /// Axes whose position is no longer trusted after an alarm
    flagged: BTreeSet<Axis>,
    default_speed: f64,
    halt_sent: bool,
}

impl GcodeDriver<Box<dyn SerialPort>> {
    /// Open a serial port and initialize the controller.
    pub fn open_serial(path: &str, baud_rate: u32) -> DriverResult<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(SERIAL_TIMEOUT)
            .open()?;
        info!("Opened motion controller on {path} at {baud_rate} baud");
        let mut driver = Self::new(port);
        driver.init()?;
        Ok(driver)
    }
}

impl<T: Read + Write> GcodeDriver<T> {
    /// Wrap an already-open transport. Call [`init`](Self::init) before moving.
    pub fn new(port: T) -> Self {
        Self {
            port,
            control: DriverControl::new(),
            flagged: Axis::iter().collect(),
            default_speed: DEFAULT_SPEED_MM_S,
            halt_sent: false,
        }
    }

    /// Clear any latched alarm and select absolute positioning.
    pub fn init(&mut self) -> DriverResult<()> {
        self.command("M999")?;
        self.command("G90")?;
        info!("Motion controller initialized");
        Ok(())
    }

    /// Set the feed rate used when a move does not specify one.
    pub fn set_default_speed(&mut self, speed_mm_s: f64) {
        self.default_speed = speed_mm_s;
    }

    /// Axes the controller has flagged as lost.
    pub fn flagged_axes(&self) -> &BTreeSet<Axis> {
        &self.flagged
    }

    /// Send a command and wait for its `ok`, returning the full response text.
    pub fn command(&mut self, command: &str) -> DriverResult<String> {
        if let Err(e) = self.control.gate() {
            self.send_halt();
            return Err(e);
        }
        debug!("-> {command}");
        self.port.write_all(format!("{command}\r\n").as_bytes())?;
        self.port.flush()?;
        let response = self.read_response(command)?;
        debug!("<- {}", response.trim());
        Ok(response)
    }

    fn send_halt(&mut self) {
        if self.halt_sent {
            return;
        }
        self.halt_sent = true;
        warn!("Halt requested, sending M112");
        if let Err(e) = self.port.write_all(b"M112\r\n") {
            warn!("Failed to send M112: {e}");
        }
        self.flagged = Axis::iter().collect();
    }

    fn read_response(&mut self, command: &str) -> DriverResult<String> {
        let mut response = String::new();
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match self.port.read(&mut byte) {
                Ok(0) => {
                    return Err(DriverError::Timeout {
                        command: command.to_string(),
                    })
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(DriverError::Timeout {
                        command: command.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            }

            if byte[0] != b'\n' {
                line.push(byte[0]);
                continue;
            }

            let text = String::from_utf8_lossy(&line).trim().to_string();
            line.clear();
            if text.is_empty() {
                continue;
            }

            if let Err(e) = classify_line(command, &text) {
                if matches!(e, DriverError::Alarm { .. }) {
                    self.flagged = Axis::iter().collect();
                }
                return Err(e);
            }

            response.push_str(&text);
            if text.starts_with("ok") {
                return Ok(response);
            }
            response.push('\n');
        }
    }
}

impl<T: Read + Write + Send> MotorDriver for GcodeDriver<T> {
    fn home(&mut self, axes: &[Axis]) -> DriverResult<AxisMap> {
        if axes.is_empty() {
            return self.current_position();
        }
        let letters: String = axes.iter().map(|a| a.letter()).collect();
        info!("Homing {letters}");
        self.command(&format!("G28.2 {letters}"))?;
        self.command("M400")?;
        for axis in axes {
            self.flagged.remove(axis);
        }
        self.current_position()
    }

    fn move_axes(
        &mut self,
        target: &AxisMap,
        home_flagged_axes: bool,
        speed: Option<f64>,
    ) -> DriverResult<()> {
        if target.is_empty() {
            return Ok(());
        }
        if home_flagged_axes {
            let lost: Vec<Axis> = target
                .keys()
                .copied()
                .filter(|a| self.flagged.contains(a))
                .collect();
            if !lost.is_empty() {
                warn!("Homing flagged axes {lost:?} before move");
                self.home(&lost)?;
            }
        }
        let command = format_move(target, speed.unwrap_or(self.default_speed));
        self.command(&command)?;
        self.command("M400")?;
        Ok(())
    }

    fn probe_axis(&mut self, axis: Axis, distance: f64) -> DriverResult<AxisMap> {
        let feed = PROBE_SPEED_MM_S * 60.0;
        let command = format!("G38.2 F{feed:.0} {axis}{:.3}", -distance.abs());
        match self.command(&command) {
            Ok(_) => {}
            Err(DriverError::Alarm { message, .. }) if message.to_lowercase().contains("probe") => {
                return Err(DriverError::ProbeMissed { axis, distance })
            }
            Err(e) => return Err(e),
        }
        self.command("M400")?;
        self.current_position()
    }

    fn current_position(&mut self) -> DriverResult<AxisMap> {
        let response = self.command("M114.2")?;
        parse_position(&response)
    }

    fn set_active_current(&mut self, currents: &AxisMap) -> DriverResult<()> {
        if currents.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = currents
            .iter()
            .map(|(axis, amps)| format!("{axis}{amps:.3}"))
            .collect();
        self.command(&format!("M907 {}", args.join(" ")))?;
        Ok(())
    }

    fn control(&self) -> DriverControl {
        self.control.clone()
    }
}

/// Build a `G0` move command. `speed` is in mm/s; G-code feed is mm/min.
pub fn format_move(target: &AxisMap, speed: f64) -> String {
    let args: Vec<String> = target
        .iter()
        .map(|(axis, value)| format!("{axis}{value:.3}"))
        .collect();
    format!("G0 F{:.0} {}", speed * 60.0, args.join(" "))
}

/// Map a controller response line to an error if it reports a fault.
fn classify_line(command: &str, line: &str) -> DriverResult<()> {
    let lower = line.to_lowercase();
    if lower.contains("alarm") || lower.contains("halt") {
        return Err(DriverError::Alarm {
            command: command.to_string(),
            message: line.to_string(),
        });
    }
    if lower.starts_with("error") {
        return Err(DriverError::Controller {
            command: command.to_string(),
            message: line.to_string(),
        });
    }
    Ok(())
}

/// Parse an `M114.2` response such as
/// `ok MCS: X:418.000 Y:353.000 Z:218.000 A:218.000 B:19.000 C:19.000`.
pub fn parse_position(response: &str) -> DriverResult<AxisMap> {
    let start = response
        .find("MCS:")
        .ok_or_else(|| DriverError::Parse(format!("no MCS position in '{}'", response.trim())))?;

    let mut position = AxisMap::new();
    for token in response[start + 4..].split_whitespace() {
        let Some((name, value)) = token.split_once(':') else {
            continue;
        };
        let Ok(axis) = name.parse::<Axis>() else {
            continue;
        };
        let value: f64 = value
            .parse()
            .map_err(|_| DriverError::Parse(format!("invalid value in '{token}'")))?;
        position.insert(axis, value);
    }

    if position.is_empty() {
        return Err(DriverError::Parse(format!(
            "no axis values in '{}'",
            response.trim()
        )));
    }
    Ok(position)
}
